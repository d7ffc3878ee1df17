//! worker-comms binary
//!
//! `agent` runs next to each worker and serves lifecycle commands,
//! `orchestrate` drives a cluster of agents, `local` runs a whole cluster
//! in-process.

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use worker_comms::agent::WorkerAgent;
use worker_comms::cluster::{ClusterLifecycleOrchestrator, ClusterTransport, LocalCluster, RemoteCluster};
use worker_comms::config::{self, CommsConfig};
use worker_comms::error::{Error, Result};
use worker_comms::logging;
use worker_comms::net::PortAllocator;
use worker_comms::session::WorkerSession;
use worker_comms::version;

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version { json } => {
            return version::print_version(*json);
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Agent { config, .. }
        | Commands::Orchestrate { config, .. }
        | Commands::Local { config, .. }
        | Commands::Allocate { config, .. } => config.clone(),
        Commands::Version { .. } | Commands::Config { .. } => None,
    };

    let config = match load_config(config_path.as_deref(), &cli.command) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // Guards must outlive the runtime so buffered file logs get flushed
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting worker-comms"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("worker-comms")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Agent { .. } => run_agent(config).await,
            Commands::Orchestrate { workers, interface, .. } => {
                run_orchestrator(config, workers, interface).await
            }
            Commands::Local { workers, .. } => run_local(config, workers).await,
            Commands::Allocate { interface, .. } => run_allocate(&config, interface),
            Commands::Version { .. } | Commands::Config { .. } => unreachable!(),
        }
    });

    if let Err(e) = result {
        error!(error = %e.format_for_log(), "Command failed");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Load the config file, then apply command-line overrides
fn load_config(path: Option<&str>, command: &Commands) -> Result<CommsConfig> {
    let mut config = CommsConfig::load(path)?;

    match command {
        Commands::Agent { worker_id, url, .. } => {
            if let Some(id) = worker_id {
                config.worker.id = Some(id.clone());
            }
            if let Some(url) = url {
                config.cluster.orchestrator_url = url.clone();
            }
        }
        Commands::Orchestrate { workers: Some(n), .. } => {
            config.cluster.expected_workers = *n;
        }
        _ => {}
    }

    config.validate()?;
    Ok(config)
}

async fn run_agent(config: CommsConfig) -> Result<()> {
    let worker_id = config.worker_id();
    info!(
        worker = %worker_id,
        orchestrator = %config.cluster.orchestrator_url,
        interface = %config.network.interface,
        "Configuration loaded"
    );

    let session = Arc::new(WorkerSession::new(worker_id, &config));
    let agent = WorkerAgent::new(session, &config.cluster)?;

    agent
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn run_orchestrator(
    config: CommsConfig,
    workers: Option<usize>,
    interface: Option<String>,
) -> Result<()> {
    let bind_addr: SocketAddr = config.cluster.bind_addr.parse().map_err(|e| {
        Error::config_field_invalid("cluster.bind_addr", format!("{}", e))
    })?;
    let expected = workers.unwrap_or(config.cluster.expected_workers);

    let cluster = RemoteCluster::bind(bind_addr, &config.cluster).await?;
    info!(expected, addr = %cluster.local_addr(), "Waiting for agents");

    let registered = tokio::select! {
        result = cluster.wait_for_workers(expected, config.cluster.wait_timeout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while waiting for agents");
            cluster.shutdown("orchestrator interrupted").await;
            return Ok(());
        }
    };
    let registered = match registered {
        Ok(ids) => ids,
        Err(e) => {
            cluster.shutdown("not enough agents").await;
            return Err(e);
        }
    };
    info!(workers = ?registered, "All agents registered");

    let orchestrator = ClusterLifecycleOrchestrator::new(&cluster)
        .with_fanout_timeout(config.cluster.fanout_timeout());

    let outcome = bring_up(&orchestrator, interface.as_deref()).await;
    match &outcome {
        Ok(()) => {
            info!("Cluster ready, press Ctrl+C to clean up");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
        Err(e) => error!(error = %e.format_for_log(), "Cluster bring-up failed, cleaning up"),
    }

    let cleanup = orchestrator.cleanup().await;
    if let Ok(reports) = &cleanup {
        for (worker_id, report) in reports {
            info!(
                worker = %worker_id,
                endpoints_closed = report.endpoints_closed,
                listener_stopped = report.listener_stopped,
                "Worker cleaned up"
            );
        }
    }
    cluster.shutdown("cleanup complete").await;

    outcome?;
    cleanup.map(|_| ())
}

/// Listen, then connect every pair of workers
async fn bring_up<T: ClusterTransport>(
    orchestrator: &ClusterLifecycleOrchestrator<T>,
    interface: Option<&str>,
) -> Result<()> {
    let addresses = orchestrator.listen(interface).await?;
    for (worker_id, address) in &addresses {
        println!("{:<16} {}", worker_id, address);
    }

    let connected = orchestrator.init_endpoints().await?;
    info!(workers = connected.len(), "Endpoints initialized");
    Ok(())
}

async fn run_local(config: CommsConfig, workers: usize) -> Result<()> {
    let ids: Vec<String> = (0..workers).map(|i| format!("w{}", i)).collect();
    let cluster = LocalCluster::spawn(ids.iter().cloned(), &config);

    let outcome = {
        let orchestrator = ClusterLifecycleOrchestrator::new(&cluster)
            .with_fanout_timeout(config.cluster.fanout_timeout());
        let outcome = match bring_up(&orchestrator, None).await {
            Ok(()) => exchange(&cluster, &ids).await,
            Err(e) => Err(e),
        };
        let cleanup = orchestrator.cleanup().await;
        outcome.and(cleanup.map(|_| ()))
    };

    cluster.shutdown().await;
    outcome
}

/// Send one message from every worker to every peer and report the counts
async fn exchange(cluster: &LocalCluster, ids: &[String]) -> Result<()> {
    for from in ids {
        let Some(session) = cluster.session(from) else {
            continue;
        };
        for to in ids.iter().filter(|to| *to != from) {
            session
                .send_to(to, format!("hello {} from {}", to, from).as_bytes())
                .await?;
        }
    }

    // Listeners count frames as they arrive
    let expected = (ids.len().saturating_sub(1)) as u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let all_received = ids
            .iter()
            .filter_map(|id| cluster.session(id))
            .all(|s| s.manager().received_count() >= expected);
        if all_received || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for id in ids {
        if let Some(session) = cluster.session(id) {
            println!(
                "{:<8} sent={} received={}",
                id,
                session.manager().sent_count(),
                session.manager().received_count()
            );
        }
    }
    Ok(())
}

fn run_allocate(config: &CommsConfig, interface: Option<String>) -> Result<()> {
    let interface = interface.unwrap_or_else(|| config.network.interface.clone());
    let address = PortAllocator::from_settings(&config.network).allocate(&interface)?;
    println!("{}", address);
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = CommsConfig::load(config.as_deref())?;
            println!("{}", cfg.to_toml()?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => match CommsConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
