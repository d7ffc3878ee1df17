//! Configuration system for worker-comms
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (WORKER_COMMS_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::net::port::DEFAULT_MAX_PROBE_ATTEMPTS;
use crate::net::{PORT_RANGE_MAX, PORT_RANGE_MIN};

/// File name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "worker-comms.toml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// Worker identity
    pub worker: WorkerSettings,

    /// Interface and port allocation
    pub network: NetworkSettings,

    /// Outbound endpoint behavior
    pub endpoint: EndpointSettings,

    /// Orchestrator and control channel
    pub cluster: ClusterSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Worker identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker identifier (derived from the hostname if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable worker name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Interface and port allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Interface whose IPv4 address is advertised (empty = default route)
    pub interface: String,

    /// Lowest port to allocate (inclusive)
    pub port_min: u16,

    /// Upper bound for allocated ports (exclusive)
    pub port_max: u16,

    /// Probe attempts before giving up (0 = unbounded)
    pub max_probe_attempts: u32,

    /// Bind the listener on 0.0.0.0 instead of the advertised IP
    pub bind_any: bool,
}

/// Endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Connect timeout in milliseconds (0 = wait indefinitely)
    pub connect_timeout_ms: u64,
}

/// Cluster control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Orchestrator WebSocket URL used by agents
    pub orchestrator_url: String,

    /// Address the orchestrator listens on for agents
    pub bind_addr: String,

    /// Cluster-wide fan-out timeout in milliseconds (0 = unbounded)
    pub fanout_timeout_ms: u64,

    /// Initial agent reconnect interval in milliseconds
    pub reconnect_interval_ms: u64,

    /// Maximum agent reconnect attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Time to wait for the orchestrator's registration ack
    pub register_timeout_ms: u64,

    /// Number of agents the orchestrator waits for
    pub expected_workers: usize,

    /// How long the orchestrator waits for agents to register
    pub wait_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port_min: PORT_RANGE_MIN,
            port_max: PORT_RANGE_MAX,
            max_probe_attempts: DEFAULT_MAX_PROBE_ATTEMPTS,
            bind_any: true,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            orchestrator_url: "ws://127.0.0.1:7400".to_string(),
            bind_addr: "0.0.0.0:7400".to_string(),
            fanout_timeout_ms: 0,
            reconnect_interval_ms: 2_000,
            max_reconnect_attempts: 0,
            register_timeout_ms: 30_000,
            expected_workers: 1,
            wait_timeout_ms: 60_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl EndpointSettings {
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }
}

impl ClusterSettings {
    pub fn fanout_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.fanout_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl CommsConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e.message()),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from(CONFIG_FILE_NAME),
            dirs::config_dir()
                .map(|p| p.join("worker-comms").join("config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".worker-comms").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/worker-comms/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Worker settings
        if let Ok(val) = std::env::var("WORKER_COMMS_WORKER_ID") {
            self.worker.id = Some(val);
        }
        if let Ok(val) = std::env::var("WORKER_COMMS_WORKER_NAME") {
            self.worker.name = Some(val);
        }

        // Network settings
        if let Ok(val) = std::env::var("WORKER_COMMS_INTERFACE") {
            self.network.interface = val;
        }
        env_parse("WORKER_COMMS_PORT_MIN", &mut self.network.port_min);
        env_parse("WORKER_COMMS_PORT_MAX", &mut self.network.port_max);
        env_parse("WORKER_COMMS_MAX_PROBE_ATTEMPTS", &mut self.network.max_probe_attempts);
        if let Ok(val) = std::env::var("WORKER_COMMS_BIND_ANY") {
            self.network.bind_any = parse_bool(&val);
        }

        // Endpoint settings
        env_parse("WORKER_COMMS_CONNECT_TIMEOUT_MS", &mut self.endpoint.connect_timeout_ms);

        // Cluster settings
        if let Ok(val) = std::env::var("WORKER_COMMS_ORCHESTRATOR_URL") {
            self.cluster.orchestrator_url = val;
        }
        if let Ok(val) = std::env::var("WORKER_COMMS_CLUSTER_BIND") {
            self.cluster.bind_addr = val;
        }
        env_parse("WORKER_COMMS_FANOUT_TIMEOUT_MS", &mut self.cluster.fanout_timeout_ms);
        env_parse("WORKER_COMMS_RECONNECT_INTERVAL_MS", &mut self.cluster.reconnect_interval_ms);
        env_parse("WORKER_COMMS_MAX_RECONNECT_ATTEMPTS", &mut self.cluster.max_reconnect_attempts);
        env_parse("WORKER_COMMS_EXPECTED_WORKERS", &mut self.cluster.expected_workers);

        // Logging settings
        if let Ok(val) = std::env::var("WORKER_COMMS_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("WORKER_COMMS_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("WORKER_COMMS_LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.worker.id {
            if id.trim().is_empty() {
                return Err(Error::config_field_invalid("worker.id", "worker id cannot be empty"));
            }
        }

        if self.network.port_min < 1024 {
            return Err(Error::config_field_invalid(
                "network.port_min",
                format!("port_min must be at least 1024, got {}", self.network.port_min),
            ));
        }
        if self.network.port_min >= self.network.port_max {
            return Err(Error::config_field_invalid(
                "network.port_max",
                format!(
                    "port range is empty: port_min ({}) must be below port_max ({})",
                    self.network.port_min, self.network.port_max
                ),
            ));
        }

        let url = &self.cluster.orchestrator_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "cluster.orchestrator_url",
                "orchestrator URL must start with ws:// or wss://",
            ));
        }
        if let Err(e) = url::Url::parse(url) {
            return Err(Error::config_field_invalid(
                "cluster.orchestrator_url",
                format!("invalid orchestrator URL '{}': {}", url, e),
            ));
        }

        if self.cluster.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::config_field_invalid(
                "cluster.bind_addr",
                format!("invalid bind address '{}'", self.cluster.bind_addr),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Worker id from config, or `<hostname>-<short uuid>` when unset
    pub fn worker_id(&self) -> String {
        if let Some(id) = &self.worker.id {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("worker-comms"))
        .or_else(|| dirs::home_dir().map(|p| p.join(".worker-comms")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Write a commented default configuration file, returning its path
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# worker-comms configuration

[worker]
# Worker identifier (derived from the hostname if not set)
# id = "worker-0"

# Human-readable worker name
# name = "gpu-node-0"

[network]
# Interface whose IPv4 address is advertised to peers.
# Empty selects the default-route interface (loopback if there is none).
interface = ""

# Allocated ports are drawn from [port_min, port_max)
port_min = 10000
port_max = 32000

# Probe attempts before giving up (0 = keep trying)
max_probe_attempts = 1024

# Listen on 0.0.0.0 rather than the advertised IP
bind_any = true

[endpoint]
# Connect timeout in milliseconds (0 = wait indefinitely)
connect_timeout_ms = 10000

[cluster]
# Orchestrator WebSocket URL (used by agents)
orchestrator_url = "ws://127.0.0.1:7400"

# Address the orchestrator listens on
bind_addr = "0.0.0.0:7400"

# Timeout for cluster-wide operations in milliseconds (0 = unbounded)
fanout_timeout_ms = 0

# Agent reconnection interval in milliseconds
reconnect_interval_ms = 2000

# Maximum agent reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# Registration ack timeout in milliseconds
register_timeout_ms = 30000

# Agents the orchestrator waits for, and for how long
expected_workers = 1
wait_timeout_ms = 60000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.worker-comms/logs/worker-comms.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
