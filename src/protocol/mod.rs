//! Control protocol between the orchestrator and worker agents
//!
//! JSON over WebSocket with versioning support.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
