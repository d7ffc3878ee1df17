//! Cluster-wide lifecycle
//!
//! The orchestrator drives every worker through listen, init and cleanup by
//! fanning commands out over a `ClusterTransport`. Two transports exist:
//! workers inside this process (`LocalCluster`) and agents connected over
//! WebSocket (`RemoteCluster`).

mod dispatch;
mod local;
mod orchestrator;
mod remote;
mod transport;

pub use dispatch::dispatch;
pub use local::LocalCluster;
pub use orchestrator::ClusterLifecycleOrchestrator;
pub use remote::RemoteCluster;
pub use transport::ClusterTransport;

pub(crate) use remote::next_envelope;
