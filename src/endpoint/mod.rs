//! Endpoints: cached outbound connections to peer workers
//!
//! An endpoint is owned by the `EndpointManager` that created it. Callers
//! get a shared handle they can send through; only the manager closes or
//! aborts it.

mod connection;
mod listener;
mod manager;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::net::WorkerAddress;

pub use connection::{Connection, Connector, TcpConnection, TcpConnector};
pub use listener::{Listener, ListenerState, LoggingHandler, MessageHandler};
pub use manager::EndpointManager;

/// Lifecycle state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Open => write!(f, "open"),
            EndpointState::Closed => write!(f, "closed"),
        }
    }
}

/// A connection to one peer address
pub struct Endpoint {
    address: WorkerAddress,
    connection: Box<dyn Connection>,
    closed: AtomicBool,
    opened_at: Instant,
}

impl Endpoint {
    pub(crate) fn new(address: WorkerAddress, connection: Box<dyn Connection>) -> Self {
        Self {
            address,
            connection,
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
        }
    }

    pub fn address(&self) -> WorkerAddress {
        self.address
    }

    pub fn state(&self) -> EndpointState {
        if self.closed.load(Ordering::SeqCst) {
            EndpointState::Closed
        } else {
            EndpointState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == EndpointState::Open
    }

    /// How long the endpoint has existed
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Send one payload to the peer.
    ///
    /// A transport failure marks the endpoint closed so the manager replaces
    /// it on the next lookup.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::EndpointClosed { address: self.address });
        }

        match self.connection.send(payload).await {
            Ok(()) => Ok(()),
            Err(e @ Error::EndpointClosed { .. }) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => {
                if !self.closed.swap(true, Ordering::SeqCst) {
                    self.connection.abort();
                }
                Err(Error::ConnectionLost {
                    address: self.address.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Graceful close. Returns false if the endpoint was already closed.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.connection.close().await {
            debug!(peer = %self.address, error = %e, "Graceful close failed");
        }
        true
    }

    /// Immediate termination. Returns false if the endpoint was already closed.
    pub(crate) fn abort(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.connection.abort();
        true
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
