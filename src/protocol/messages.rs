//! Control protocol messages
//!
//! Orchestrator ↔ agent messages, JSON over WebSocket with a `type`
//! discriminator. Worker commands and their replies ride inside
//! `REQUEST`/`RESPONSE` messages, correlated by `request_id`.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::net::{AddressMap, WorkerAddress};
use crate::session::CleanupReport;

use super::ProtocolVersion;

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: ProtocolVersion,

    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Agent → Orchestrator ───────────────────────────────────
    Register(RegisterRequest),
    Response(ControlResponse),

    // ─── Orchestrator → Agent ───────────────────────────────────
    RegisterAck(RegisterAckResponse),
    Request(ControlRequest),

    // ─── Either direction ───────────────────────────────────────
    Shutdown(ShutdownMessage),
    Error(ErrorMessage),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register(_) => "REGISTER",
            Message::Response(_) => "RESPONSE",
            Message::RegisterAck(_) => "REGISTER_ACK",
            Message::Request(_) => "REQUEST",
            Message::Shutdown(_) => "SHUTDOWN",
            Message::Error(_) => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: Uuid,
    pub command: WorkerCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub request_id: Uuid,
    pub reply: WorkerReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownMessage {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

// ─────────────────────────────────────────────────────────────────
// Worker Commands
// ─────────────────────────────────────────────────────────────────

/// A lifecycle step executed on one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Allocate a port; `None` uses the worker's configured interface.
    ///
    /// `claimed` lists addresses already held by peers, which must not be
    /// handed out again.
    AllocatePort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interface: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        claimed: Vec<WorkerAddress>,
    },
    SetAddresses { addresses: AddressMap },
    StartListener,
    InitEndpoints,
    Cleanup,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::AllocatePort { .. } => "allocate_port",
            WorkerCommand::SetAddresses { .. } => "set_addresses",
            WorkerCommand::StartListener => "start_listener",
            WorkerCommand::InitEndpoints => "init_endpoints",
            WorkerCommand::Cleanup => "cleanup",
        }
    }
}

/// A worker's answer to a `WorkerCommand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReply {
    PortAllocated { address: WorkerAddress },
    AddressesSet { entries: usize },
    ListenerStarted { address: SocketAddr },
    EndpointsReady { connected: usize },
    CleanedUp { report: CleanupReport },
    Failed { code: u16, message: String },
}

impl WorkerReply {
    pub fn failed(err: &Error) -> Self {
        WorkerReply::Failed {
            code: err.code() as u16,
            message: err.to_string(),
        }
    }

    /// Turn a `Failed` reply into `WorkerFailed` for `worker_id`
    pub fn into_result(self, worker_id: &str) -> Result<Self> {
        match self {
            WorkerReply::Failed { code, message } => Err(Error::worker_failed(
                worker_id,
                format!("[E{}] {}", code, message),
            )),
            reply => Ok(reply),
        }
    }
}
