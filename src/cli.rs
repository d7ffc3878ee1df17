//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// worker-comms - endpoint lifecycle for distributed query workers
///
/// Run an agent next to each worker, then drive the cluster through
/// listen, init and cleanup from the orchestrator.
#[derive(Parser, Debug)]
#[command(name = "worker-comms")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker agent (connects to the orchestrator and serves commands)
    Agent {
        /// Path to configuration file
        #[arg(short, long, env = "WORKER_COMMS_CONFIG")]
        config: Option<String>,

        /// Worker id (overrides worker.id)
        #[arg(long)]
        worker_id: Option<String>,

        /// Orchestrator URL (overrides cluster.orchestrator_url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Accept agents and drive one listen / init / cleanup cycle
    Orchestrate {
        /// Path to configuration file
        #[arg(short, long, env = "WORKER_COMMS_CONFIG")]
        config: Option<String>,

        /// Number of agents to wait for (overrides cluster.expected_workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Interface every worker allocates on
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Run a whole cluster in this process and exchange a message between every pair
    Local {
        /// Path to configuration file
        #[arg(short, long, env = "WORKER_COMMS_CONFIG")]
        config: Option<String>,

        /// Number of in-process workers
        #[arg(short, long, default_value = "3")]
        workers: usize,
    },

    /// Allocate a free port on an interface and print the address
    Allocate {
        /// Path to configuration file
        #[arg(short, long, env = "WORKER_COMMS_CONFIG")]
        config: Option<String>,

        /// Interface name (default: network.interface)
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Display version and build information
    Version {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to create the file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_agent_command() {
        let cli = Cli::parse_from(["worker-comms", "agent", "--worker-id", "w3"]);
        match cli.command {
            Commands::Agent { config, worker_id, url } => {
                assert!(config.is_none());
                assert_eq!(worker_id.as_deref(), Some("w3"));
                assert!(url.is_none());
            }
            _ => panic!("Expected Agent command"),
        }
    }

    #[test]
    fn test_orchestrate_options() {
        let cli = Cli::parse_from([
            "worker-comms",
            "orchestrate",
            "--workers",
            "4",
            "--interface",
            "eth0",
        ]);
        match cli.command {
            Commands::Orchestrate { workers, interface, .. } => {
                assert_eq!(workers, Some(4));
                assert_eq!(interface.as_deref(), Some("eth0"));
            }
            _ => panic!("Expected Orchestrate command"),
        }
    }

    #[test]
    fn test_local_default_workers() {
        let cli = Cli::parse_from(["worker-comms", "local"]);
        match cli.command {
            Commands::Local { workers, .. } => assert_eq!(workers, 3),
            _ => panic!("Expected Local command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["worker-comms", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_version_json() {
        let cli = Cli::parse_from(["worker-comms", "version", "--json"]);
        assert!(matches!(cli.command, Commands::Version { json: true }));
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["worker-comms", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
