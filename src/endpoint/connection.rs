//! Outbound connections
//!
//! `Connector` opens a connection to a peer address; `Connection` is the
//! handle an endpoint sends through. The TCP implementation speaks the
//! frame format from `net::frame`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::EndpointSettings;
use crate::error::{Error, Result};
use crate::net::frame;
use crate::net::WorkerAddress;

// ─────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────

/// Opens connections to peer workers
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: WorkerAddress) -> Result<Box<dyn Connection>>;
}

/// A live connection to a single peer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one opaque payload
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Graceful close: tell the peer we're done, flush, shut down writes
    async fn close(&self) -> Result<()>;

    /// Immediate termination without the close handshake
    fn abort(&self);
}

// ─────────────────────────────────────────────────────────────────
// TCP
// ─────────────────────────────────────────────────────────────────

/// Connects over plain TCP
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    pub fn from_settings(settings: &EndpointSettings) -> Self {
        Self::new(settings.connect_timeout())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: WorkerAddress) -> Result<Box<dyn Connection>> {
        let connect = TcpStream::connect(address.socket_addr());

        let result = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::ConnectionTimeout {
                    address: address.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })?,
            None => connect.await,
        };
        let stream = result.map_err(|source| Error::ConnectionEstablish { address, source })?;

        if let Err(e) = stream.set_nodelay(true) {
            trace!(peer = %address, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Box::new(TcpConnection::new(address, stream)))
    }
}

/// Framed TCP stream to one peer
pub struct TcpConnection {
    address: WorkerAddress,
    stream: Mutex<Option<TcpStream>>,
    aborted: AtomicBool,
}

impl TcpConnection {
    pub fn new(address: WorkerAddress, stream: TcpStream) -> Self {
        Self {
            address,
            stream: Mutex::new(Some(stream)),
            aborted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock().await;

        // An abort that raced a send in flight lands here
        if self.aborted.load(Ordering::SeqCst) {
            guard.take();
            return Err(Error::EndpointClosed { address: self.address });
        }

        let stream = guard.as_mut().ok_or(Error::EndpointClosed { address: self.address })?;
        frame::write_data(stream, payload).await
    }

    async fn close(&self) -> Result<()> {
        let Some(mut stream) = self.stream.lock().await.take() else {
            return Ok(());
        };

        let stop = frame::write_stop(&mut stream).await;
        let shutdown = stream.shutdown().await;
        debug!(peer = %self.address, "Connection closed");

        stop?;
        shutdown?;
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        // If a send holds the lock, it drops the stream when it sees the flag
        if let Ok(mut guard) = self.stream.try_lock() {
            if guard.take().is_some() {
                debug!(peer = %self.address, "Connection aborted");
            }
        }
    }
}
