//! Error types for worker-comms
//!
//! Provides structured error handling with:
//! - Numeric error codes that survive the trip across the control channel
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::net::WorkerAddress;

/// Result type alias for comms operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Interface / port errors (3xx)
    InterfaceUnavailable = 300,
    PortProbeFailed = 301,
    PortExhausted = 302,

    // Endpoint errors (4xx)
    ConnectionFailed = 400,
    ConnectionTimeout = 401,
    ConnectionLost = 402,
    EndpointClosed = 403,
    CacheCleared = 404,
    FrameTooLarge = 405,
    FrameMalformed = 406,

    // Listener errors (5xx)
    ListenerBind = 500,
    ListenerRunning = 501,

    // Cluster errors (6xx)
    AddressesNotSet = 600,
    UnknownWorker = 601,
    WorkerFailed = 602,
    FanOutTimeout = 603,
    WorkerUnavailable = 604,
    AddressCollision = 605,

    // Control protocol errors (7xx)
    ProtocolVersion = 700,
    ProtocolMalformed = 701,
    RegistrationFailed = 702,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            700..=799 => 70,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for worker-comms
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON (de)serialization error on the control channel
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error on the control channel
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Interface / Port Errors
    // ─────────────────────────────────────────────────────────────

    /// The requested interface does not exist or carries no IPv4 address
    #[error("Network interface '{interface}' has no IPv4 address")]
    InterfaceUnavailable { interface: String },

    /// A probe bind failed for a reason other than "address in use"
    #[error("Failed to probe port {port}: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No free port was confirmed within the attempt budget
    #[error("No free port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    // ─────────────────────────────────────────────────────────────
    // Endpoint Errors
    // ─────────────────────────────────────────────────────────────

    /// Outbound connect attempt failed
    #[error("Failed to connect to {address}")]
    ConnectionEstablish {
        address: WorkerAddress,
        #[source]
        source: std::io::Error,
    },

    /// Connect attempt did not complete in time
    #[error("Connection to {address} timed out after {timeout_ms}ms")]
    ConnectionTimeout { address: String, timeout_ms: u64 },

    /// Established connection broke while in use
    #[error("Lost connection to {address}: {message}")]
    ConnectionLost { address: String, message: String },

    /// Send attempted on an endpoint that is already closed
    #[error("Endpoint to {address} is closed")]
    EndpointClosed { address: WorkerAddress },

    /// The endpoint cache was cleared while a connection was being established
    #[error("Endpoint cache was cleared while connecting to {address}")]
    CacheCleared { address: WorkerAddress },

    /// Frame exceeds the maximum frame size
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame header could not be decoded
    #[error("Malformed frame: {message}")]
    FrameMalformed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Listener Errors
    // ─────────────────────────────────────────────────────────────

    /// Listener could not bind its address
    #[error("Failed to bind listener on {address}")]
    ListenerBind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A listener is already running for this manager
    #[error("Listener already running on {address}")]
    ListenerAlreadyRunning { address: String },

    // ─────────────────────────────────────────────────────────────
    // Cluster Errors
    // ─────────────────────────────────────────────────────────────

    /// The address registry has not been populated for this session
    #[error("Cluster address map has not been distributed to this worker")]
    AddressesNotSet,

    /// Worker id is not present in the address registry
    #[error("Unknown worker: {worker_id}")]
    UnknownWorker { worker_id: String },

    /// A worker-side call failed during a cluster-wide fan-out
    #[error("Worker {worker_id} failed: {message}")]
    WorkerFailed { worker_id: String, message: String },

    /// A cluster-wide fan-out did not complete within its budget
    #[error("Cluster operation '{operation}' timed out after {timeout_ms}ms")]
    FanOutTimeout { operation: String, timeout_ms: u64 },

    /// Worker is not connected to the orchestrator
    #[error("Worker {worker_id} is unavailable")]
    WorkerUnavailable { worker_id: String },

    /// Several workers were still allocated the same address after re-allocation
    #[error("Workers {workers} share address {address} after {rounds} allocation rounds")]
    AddressCollision {
        address: WorkerAddress,
        workers: String,
        rounds: u32,
    },

    // ─────────────────────────────────────────────────────────────
    // Control Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed or unexpected control message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Orchestrator rejected the worker registration
    #[error("Registration failed: {message}")]
    RegistrationFailed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::InterfaceUnavailable { .. } => ErrorCode::InterfaceUnavailable,
            Error::PortProbe { .. } => ErrorCode::PortProbeFailed,
            Error::PortExhausted { .. } => ErrorCode::PortExhausted,

            Error::ConnectionEstablish { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::EndpointClosed { .. } => ErrorCode::EndpointClosed,
            Error::CacheCleared { .. } => ErrorCode::CacheCleared,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::FrameMalformed { .. } => ErrorCode::FrameMalformed,

            Error::ListenerBind { .. } => ErrorCode::ListenerBind,
            Error::ListenerAlreadyRunning { .. } => ErrorCode::ListenerRunning,

            Error::AddressesNotSet => ErrorCode::AddressesNotSet,
            Error::UnknownWorker { .. } => ErrorCode::UnknownWorker,
            Error::WorkerFailed { .. } => ErrorCode::WorkerFailed,
            Error::FanOutTimeout { .. } => ErrorCode::FanOutTimeout,
            Error::WorkerUnavailable { .. } => ErrorCode::WorkerUnavailable,
            Error::AddressCollision { .. } => ErrorCode::AddressCollision,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::RegistrationFailed { .. } => ErrorCode::RegistrationFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionEstablish { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::EndpointClosed { .. }
                | Error::CacheCleared { .. }
                | Error::PortExhausted { .. }
                | Error::WorkerUnavailable { .. }
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::ProtocolVersion { .. }
                | Error::RegistrationFailed { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'worker-comms config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'worker-comms config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::InterfaceUnavailable { .. } => Some(
                "Check the interface name with 'ip addr' and make sure it has an IPv4 address, or leave it empty to use the default interface."
            ),
            Error::PortExhausted { .. } => Some(
                "Widen [network] port_min/port_max or raise max_probe_attempts."
            ),

            Error::ConnectionEstablish { .. } => Some(
                "Verify the peer worker is running and its listener has been started."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The peer may be unreachable. Check firewall rules or raise [endpoint] connect_timeout_ms."
            ),

            Error::ListenerBind { .. } => Some(
                "Another process may have taken the allocated port. Re-run the cluster listen step to allocate a new one."
            ),

            Error::AddressesNotSet => Some(
                "Run the cluster 'listen' step before resolving or connecting to peers."
            ),
            Error::FanOutTimeout { .. } => Some(
                "A worker did not respond in time. Check worker logs or raise [cluster] fanout_timeout_ms."
            ),
            Error::WorkerUnavailable { .. } => Some(
                "Make sure every worker agent is connected to the orchestrator."
            ),
            Error::AddressCollision { .. } => Some(
                "Widen [network] port_min/port_max so each worker on a host can get its own port."
            ),

            Error::ProtocolVersion { .. } => Some(
                "Orchestrator and agents must run compatible versions. Run 'worker-comms version' on each node."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an interface unavailable error
    pub fn interface_unavailable(interface: impl Into<String>) -> Self {
        Error::InterfaceUnavailable {
            interface: interface.into(),
        }
    }

    /// Create a worker failure error
    pub fn worker_failed(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::WorkerFailed {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    /// Create a malformed protocol message error
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
