//! Worker agent
//!
//! Runs next to a worker process and executes the orchestrator's lifecycle
//! commands against the local `WorkerSession`.

mod client;

pub use client::{ConnectionState, WorkerAgent};
