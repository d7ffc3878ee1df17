//! Worker session: the per-worker communication context
//!
//! Created once when a worker starts and passed by reference to whatever
//! needs it. Owns the worker's address registry, endpoint manager and port
//! allocator, so there is exactly one manager per worker by construction.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::try_join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CommsConfig, NetworkSettings};
use crate::endpoint::{Connector, Endpoint, EndpointManager, LoggingHandler, MessageHandler};
use crate::error::{Error, Result};
use crate::net::{AddressMap, PortAllocator, WorkerAddress, WorkerId};
use crate::registry::AddressRegistry;

/// Outcome of tearing down a worker's endpoints and listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub endpoints_closed: usize,
    pub listener_stopped: bool,
}

/// Everything one worker needs to talk to its peers
pub struct WorkerSession {
    worker_id: WorkerId,
    registry: AddressRegistry,
    manager: EndpointManager,
    allocator: PortAllocator,
    network: NetworkSettings,
    handler: Arc<dyn MessageHandler>,
    allocated: Mutex<Option<WorkerAddress>>,
}

impl WorkerSession {
    /// Session using TCP endpoints configured from `config`
    pub fn new(worker_id: impl Into<WorkerId>, config: &CommsConfig) -> Self {
        Self::build(worker_id.into(), config, EndpointManager::from_settings(&config.endpoint))
    }

    /// Session whose endpoints are opened through `connector`
    pub fn with_connector(
        worker_id: impl Into<WorkerId>,
        config: &CommsConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::build(worker_id.into(), config, EndpointManager::new(connector))
    }

    fn build(worker_id: WorkerId, config: &CommsConfig, manager: EndpointManager) -> Self {
        Self {
            worker_id,
            registry: AddressRegistry::new(),
            manager,
            allocator: PortAllocator::from_settings(&config.network),
            network: config.network.clone(),
            handler: Arc::new(LoggingHandler),
            allocated: Mutex::new(None),
        }
    }

    /// Replace the handler that receives inbound payloads
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &EndpointManager {
        &self.manager
    }

    // ─────────────────────────────────────────────────────────────
    // Addresses
    // ─────────────────────────────────────────────────────────────

    /// Allocate this worker's communication address.
    ///
    /// `None` uses the configured interface.
    pub fn allocate_port(&self, interface: Option<&str>) -> Result<WorkerAddress> {
        self.allocate_port_excluding(interface, &[])
    }

    /// Allocate an address that is not one of `claimed`
    pub fn allocate_port_excluding(
        &self,
        interface: Option<&str>,
        claimed: &[WorkerAddress],
    ) -> Result<WorkerAddress> {
        let interface = interface.unwrap_or(&self.network.interface);
        let address = self.allocator.allocate_excluding(interface, claimed)?;
        *self.allocated.lock() = Some(address);
        info!(worker = %self.worker_id, address = %address, "Port allocated");
        Ok(address)
    }

    /// Store the cluster address map, returning the number of entries
    pub fn set_addresses(&self, map: AddressMap) -> usize {
        let entries = map.len();
        if !map.contains_key(&self.worker_id) {
            warn!(worker = %self.worker_id, "Address map has no entry for this worker");
        }
        self.registry.set(map);
        entries
    }

    pub fn addresses(&self) -> Option<AddressMap> {
        self.registry.snapshot()
    }

    pub fn resolve(&self, worker_id: &str) -> Result<WorkerAddress> {
        self.registry.resolve(worker_id)
    }

    /// This worker's advertised address: its registry entry, else the last allocation
    pub fn local_address(&self) -> Option<WorkerAddress> {
        self.registry
            .resolve(&self.worker_id)
            .ok()
            .or(*self.allocated.lock())
    }

    // ─────────────────────────────────────────────────────────────
    // Endpoints
    // ─────────────────────────────────────────────────────────────

    /// Endpoint to the worker registered as `worker_id`
    pub async fn endpoint_to(&self, worker_id: &str) -> Result<Arc<Endpoint>> {
        let address = self.resolve(worker_id)?;
        self.manager.get_or_create(address).await
    }

    /// Send one payload to `worker_id`
    pub async fn send_to(&self, worker_id: &str, payload: &[u8]) -> Result<()> {
        let address = self.resolve(worker_id)?;
        self.manager.send(address, payload).await
    }

    /// Start accepting peer connections on the advertised port.
    ///
    /// Returns the bound address; a running listener is left alone.
    pub async fn start_listener(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.manager.listener_addr() {
            return Ok(addr);
        }

        let advertised = match self.registry.resolve(&self.worker_id) {
            Ok(address) => address,
            Err(e) => (*self.allocated.lock()).ok_or(e)?,
        };
        let ip = if self.network.bind_any {
            Ipv4Addr::UNSPECIFIED
        } else {
            advertised.ip()
        };
        let bind = SocketAddr::V4(SocketAddrV4::new(ip, advertised.port()));

        self.manager.start_listener(bind, Arc::clone(&self.handler)).await
    }

    /// Connect to every other worker in the registry.
    ///
    /// Starts the listener first if needed. Returns the number of peers.
    pub async fn init_endpoints(&self) -> Result<usize> {
        let map = self.registry.snapshot().ok_or(Error::AddressesNotSet)?;
        self.start_listener().await?;

        let peers: Vec<WorkerAddress> = map
            .iter()
            .filter(|(id, _)| **id != self.worker_id)
            .map(|(_, address)| *address)
            .collect();

        try_join_all(peers.iter().map(|address| self.manager.get_or_create(*address))).await?;

        debug!(worker = %self.worker_id, peers = peers.len(), "Endpoints initialized");
        Ok(peers.len())
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Gracefully close all endpoints, then stop the listener
    pub async fn cleanup(&self) -> CleanupReport {
        let endpoints_closed = self.manager.close_all().await;
        let listener_stopped = self.manager.close_listener().await;

        let report = CleanupReport {
            endpoints_closed,
            listener_stopped,
        };
        info!(worker = %self.worker_id, closed = endpoints_closed, listener_stopped, "Worker cleaned up");
        report
    }

    /// Abort all endpoints and stop the listener without any handshake
    pub fn shutdown(&self) -> CleanupReport {
        CleanupReport {
            endpoints_closed: self.manager.abort_all(),
            listener_stopped: self.manager.stop_listener(),
        }
    }

    /// Run `body`, then clean up no matter how it finished.
    ///
    /// A panic in `body` is re-raised after teardown.
    pub async fn run_scoped<F, T>(&self, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;

        self.cleanup().await;
        // Anything opened while cleanup ran
        let late = self.shutdown();
        if late.endpoints_closed > 0 || late.listener_stopped {
            debug!(worker = %self.worker_id, ?late, "Aborted resources opened during cleanup");
        }

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("worker_id", &self.worker_id)
            .field("addresses", &self.registry.len())
            .field("endpoints", &self.manager.endpoint_count())
            .finish()
    }
}
