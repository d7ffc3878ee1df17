//! Endpoint manager: one per worker session
//!
//! Caches at most one open endpoint per peer address. Concurrent lookups of
//! an address share a single in-flight connect through a per-address
//! `OnceCell`; the cache lock is never held across an await.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::EndpointSettings;
use crate::error::{Error, Result};
use crate::net::WorkerAddress;

use super::connection::{Connector, TcpConnector};
use super::listener::{Listener, ListenerState, MessageHandler};
use super::Endpoint;

type Slot = Arc<OnceCell<Arc<Endpoint>>>;

static GLOBAL: OnceLock<EndpointManager> = OnceLock::new();

/// Owns this worker's endpoints and its inbound listener
pub struct EndpointManager {
    connector: Arc<dyn Connector>,
    endpoints: Mutex<HashMap<WorkerAddress, Slot>>,
    listener: Mutex<Option<Listener>>,
    sent: AtomicU64,
    received: Arc<AtomicU64>,
}

impl EndpointManager {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            endpoints: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn from_settings(settings: &EndpointSettings) -> Self {
        Self::new(Arc::new(TcpConnector::from_settings(settings)))
    }

    /// Process-wide manager, created on first use with default settings.
    ///
    /// Prefer the manager owned by a `WorkerSession`; this exists for code
    /// that has no session to thread through.
    pub fn global() -> &'static EndpointManager {
        GLOBAL.get_or_init(|| {
            debug!("Creating process-wide endpoint manager");
            EndpointManager::from_settings(&EndpointSettings::default())
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Endpoints
    // ─────────────────────────────────────────────────────────────

    /// Return the open endpoint for `address`, connecting if needed
    pub async fn get_or_create(&self, address: WorkerAddress) -> Result<Arc<Endpoint>> {
        loop {
            let slot = Arc::clone(self.endpoints.lock().entry(address).or_default());

            let endpoint = match slot.get_or_try_init(|| self.establish(address)).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    self.evict(&address, &slot);
                    return Err(e);
                }
            };

            if !endpoint.is_open() {
                debug!(peer = %address, "Evicting closed endpoint");
                self.evict(&address, &slot);
                continue;
            }

            // close_all/abort_all may have drained the cache while we connected
            if !self.is_current(&address, &slot) {
                endpoint.abort();
                return Err(Error::CacheCleared { address });
            }

            return Ok(Arc::clone(endpoint));
        }
    }

    async fn establish(&self, address: WorkerAddress) -> Result<Arc<Endpoint>> {
        debug!(peer = %address, "Opening endpoint");
        let connection = self.connector.connect(address).await?;
        info!(peer = %address, "Endpoint established");
        Ok(Arc::new(Endpoint::new(address, connection)))
    }

    /// Drop `slot` from the cache unless it has already been replaced
    fn evict(&self, address: &WorkerAddress, slot: &Slot) {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(address).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            endpoints.remove(address);
        }
    }

    fn is_current(&self, address: &WorkerAddress, slot: &Slot) -> bool {
        self.endpoints
            .lock()
            .get(address)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Send `payload` to `address`, creating the endpoint on first use
    pub async fn send(&self, address: WorkerAddress, payload: &[u8]) -> Result<()> {
        let endpoint = self.get_or_create(address).await?;
        endpoint.send(payload).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Gracefully close every open endpoint and clear the cache.
    ///
    /// Returns how many endpoints were closed by this call.
    pub async fn close_all(&self) -> usize {
        let endpoints = self.drain();
        let closed = join_all(endpoints.iter().map(|ep| ep.close()))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();

        if closed > 0 {
            info!(closed, "Closed all endpoints");
        }
        closed
    }

    /// Terminate every open endpoint immediately and clear the cache
    pub fn abort_all(&self) -> usize {
        let aborted = self
            .drain()
            .iter()
            .filter(|ep| ep.abort())
            .count();

        if aborted > 0 {
            info!(aborted, "Aborted all endpoints");
        }
        aborted
    }

    fn drain(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }

    /// Number of cached endpoints that are still open
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .lock()
            .values()
            .filter(|slot| slot.get().is_some_and(|ep| ep.is_open()))
            .count()
    }

    /// Whether an open endpoint to `address` is cached
    pub fn is_cached(&self, address: &WorkerAddress) -> bool {
        self.endpoints
            .lock()
            .get(address)
            .and_then(|slot| slot.get())
            .is_some_and(|ep| ep.is_open())
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────
    // Listener
    // ─────────────────────────────────────────────────────────────

    /// Bind the inbound listener. Only one may run at a time.
    pub async fn start_listener(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SocketAddr> {
        if let Some(address) = self.running_listener_addr() {
            return Err(Error::ListenerAlreadyRunning {
                address: address.to_string(),
            });
        }

        let listener = Listener::bind(bind_addr, handler, Arc::clone(&self.received)).await?;
        let local_addr = listener.local_addr();

        let mut slot = self.listener.lock();
        if let Some(running) = slot.as_ref().filter(|l| l.is_listening()) {
            // Lost a race with another start; the new listener stops on drop
            return Err(Error::ListenerAlreadyRunning {
                address: running.local_addr().to_string(),
            });
        }
        *slot = Some(listener);

        Ok(local_addr)
    }

    /// Stop the listener if one is present. Returns whether one was stopped.
    pub fn stop_listener(&self) -> bool {
        match self.listener.lock().take() {
            Some(listener) => listener.stop(),
            None => false,
        }
    }

    /// Stop the listener and wait until its port is released
    pub async fn close_listener(&self) -> bool {
        let listener = self.listener.lock().take();
        match listener {
            Some(mut listener) => listener.stop_and_wait().await,
            None => false,
        }
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener
            .lock()
            .as_ref()
            .map_or(ListenerState::Stopped, |l| l.state())
    }

    fn running_listener_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .filter(|l| l.is_listening())
            .map(|l| l.local_addr())
    }

    /// Address of the running listener
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.running_listener_addr()
    }
}

impl Drop for EndpointManager {
    fn drop(&mut self) {
        let aborted = self.abort_all();
        let stopped = self.stop_listener();
        if aborted > 0 || stopped {
            debug!(aborted, stopped, "Endpoint manager dropped with live resources");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Connection, EndpointState, LoggingHandler};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
        aborts: AtomicUsize,
        broken: AtomicBool,
    }

    struct MockConnector {
        counters: Arc<Counters>,
        delay: Duration,
        gate: Option<Arc<Notify>>,
        refuse: bool,
    }

    impl MockConnector {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                delay: Duration::ZERO,
                gate: None,
                refuse: false,
            }
        }
    }

    struct MockConnection(Arc<Counters>);

    #[async_trait]
    impl Connection for MockConnection {
        async fn send(&self, _payload: &[u8]) -> Result<()> {
            if self.0.broken.load(Ordering::SeqCst) {
                return Err(Error::ConnectionLost {
                    address: "mock".into(),
                    message: "broken pipe".into(),
                });
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn abort(&self) {
            self.0.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, address: WorkerAddress) -> Result<Box<dyn Connection>> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            if self.refuse {
                return Err(Error::ConnectionEstablish {
                    address,
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            Ok(Box::new(MockConnection(Arc::clone(&self.counters))))
        }
    }

    fn peer(port: u16) -> WorkerAddress {
        WorkerAddress::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_connects_once() {
        let counters = Arc::new(Counters::default());
        let mut connector = MockConnector::new(Arc::clone(&counters));
        connector.delay = Duration::from_millis(20);
        let manager = Arc::new(EndpointManager::new(Arc::new(connector)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_or_create(peer(20001)).await.unwrap() })
            })
            .collect();

        let mut endpoints = Vec::new();
        for handle in handles {
            endpoints.push(handle.await.unwrap());
        }

        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert!(endpoints.iter().all(|ep| Arc::ptr_eq(ep, &endpoints[0])));
        assert_eq!(manager.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(Arc::clone(&counters))));

        manager.get_or_create(peer(20001)).await.unwrap();
        manager.get_or_create(peer(20002)).await.unwrap();

        assert_eq!(manager.close_all().await, 2);
        assert_eq!(manager.close_all().await, 0);
        assert_eq!(manager.abort_all(), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(manager.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(Arc::clone(&counters))));

        let endpoint = manager.get_or_create(peer(20001)).await.unwrap();

        assert_eq!(manager.abort_all(), 1);
        assert_eq!(manager.abort_all(), 0);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(matches!(
            endpoint.send(b"x").await,
            Err(Error::EndpointClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fresh_endpoint_after_close_all() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(Arc::clone(&counters))));

        let first = manager.get_or_create(peer(20001)).await.unwrap();
        manager.close_all().await;
        let second = manager.get_or_create(peer(20001)).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_endpoint_is_replaced() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(Arc::clone(&counters))));

        let first = manager.get_or_create(peer(20001)).await.unwrap();
        assert!(first.abort());
        assert!(!manager.is_cached(&peer(20001)));

        let second = manager.get_or_create(peer(20001)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(manager.is_cached(&peer(20001)));
    }

    #[tokio::test]
    async fn test_clear_during_connect_aborts_new_endpoint() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Notify::new());
        let mut connector = MockConnector::new(Arc::clone(&counters));
        connector.gate = Some(Arc::clone(&gate));
        let manager = Arc::new(EndpointManager::new(Arc::new(connector)));

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_or_create(peer(20001)).await })
        };

        while counters.connects.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.abort_all(), 0);
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::CacheCleared { .. })));
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_drops_endpoint_from_count() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(Arc::clone(&counters))));

        manager.send(peer(20001), b"a").await.unwrap();
        assert_eq!(manager.endpoint_count(), 1);

        counters.broken.store(true, Ordering::SeqCst);
        assert!(manager.send(peer(20001), b"b").await.is_err());
        assert_eq!(manager.endpoint_count(), 0);
        assert!(!manager.is_cached(&peer(20001)));

        counters.broken.store(false, Ordering::SeqCst);
        manager.send(peer(20001), b"c").await.unwrap();
        assert_eq!(manager.endpoint_count(), 1);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_slot() {
        let counters = Arc::new(Counters::default());
        let mut connector = MockConnector::new(Arc::clone(&counters));
        connector.refuse = true;
        let manager = EndpointManager::new(Arc::new(connector));

        for port in 20001..20004 {
            let err = manager.get_or_create(peer(port)).await.unwrap_err();
            assert!(matches!(err, Error::ConnectionEstablish { .. }));
        }

        assert!(manager.endpoints.lock().is_empty());
        assert_eq!(manager.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_send_counts() {
        let counters = Arc::new(Counters::default());
        let manager = EndpointManager::new(Arc::new(MockConnector::new(counters)));

        manager.send(peer(20001), b"a").await.unwrap();
        manager.send(peer(20001), b"b").await.unwrap();

        assert_eq!(manager.sent_count(), 2);
        assert_eq!(manager.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_single_listener() {
        let manager = EndpointManager::new(Arc::new(TcpConnector::default()));
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

        manager.start_listener(bind, Arc::new(LoggingHandler)).await.unwrap();
        assert_eq!(manager.listener_state(), ListenerState::Listening);

        let err = manager
            .start_listener(bind, Arc::new(LoggingHandler))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ListenerAlreadyRunning { .. }));

        assert!(manager.stop_listener());
        assert!(!manager.stop_listener());
        assert_eq!(manager.listener_state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_close_listener_frees_port() {
        let manager = EndpointManager::new(Arc::new(TcpConnector::default()));
        let addr = manager
            .start_listener("127.0.0.1:0".parse().unwrap(), Arc::new(LoggingHandler))
            .await
            .unwrap();

        assert!(manager.close_listener().await);
        assert!(!manager.close_listener().await);
        assert!(tokio::net::TcpListener::bind(addr).await.is_ok());
    }

    #[test]
    fn test_global_is_shared() {
        let a = EndpointManager::global() as *const EndpointManager;
        let b = EndpointManager::global() as *const EndpointManager;
        assert_eq!(a, b);
    }
}
