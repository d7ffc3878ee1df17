//! worker-comms - endpoint lifecycle management for distributed query workers
//!
//! Each worker allocates a port, learns every peer's address, keeps one
//! cached outbound endpoint per peer and one inbound listener, and tears all
//! of it down when the query ends. An orchestrator drives the whole cluster
//! through those phases.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod version;

pub use cluster::{ClusterLifecycleOrchestrator, ClusterTransport, LocalCluster, RemoteCluster};
pub use config::CommsConfig;
pub use endpoint::{Endpoint, EndpointManager, Listener, MessageHandler};
pub use error::{Error, ErrorCode, Result};
pub use net::{AddressMap, PortAllocator, WorkerAddress, WorkerId};
pub use registry::AddressRegistry;
pub use session::{CleanupReport, WorkerSession};
