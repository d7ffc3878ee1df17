//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use worker_comms::config::CommsConfig;
use worker_comms::endpoint::{Connection, Connector, MessageHandler, TcpConnector};
use worker_comms::net::WorkerAddress;
use worker_comms::session::WorkerSession;

/// Config with short timeouts so a broken test fails fast
pub fn test_config() -> CommsConfig {
    let mut config = CommsConfig::default();
    config.endpoint.connect_timeout_ms = 2_000;
    config.cluster.fanout_timeout_ms = 10_000;
    config.cluster.reconnect_interval_ms = 50;
    config.cluster.register_timeout_ms = 5_000;
    config
}

pub fn worker_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("w{}", i)).collect()
}

/// Sessions that record what they receive, plus the handlers to inspect
pub fn collecting_sessions(count: usize) -> (Vec<WorkerSession>, Vec<Arc<CollectingHandler>>) {
    let config = test_config();
    worker_ids(count)
        .into_iter()
        .map(|id| {
            let handler = CollectingHandler::new();
            let session = WorkerSession::new(id, &config).with_handler(handler.clone());
            (session, handler)
        })
        .unzip()
}

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

/// Keeps every payload it is handed
#[derive(Default)]
pub struct CollectingHandler {
    messages: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    arrived: Notify,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    /// Wait until at least `count` messages arrived; false on timeout
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrived = self.arrived.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn on_message(&self, from: SocketAddr, payload: Vec<u8>) -> anyhow::Result<()> {
        self.messages.lock().push((from, payload));
        self.arrived.notify_waiters();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Connectors
// ─────────────────────────────────────────────────────────────────

/// TCP connector that counts how many connections it opened
#[derive(Default)]
pub struct CountingConnector {
    inner: TcpConnector,
    connects: AtomicUsize,
}

impl CountingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, address: WorkerAddress) -> worker_comms::Result<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(address).await
    }
}
