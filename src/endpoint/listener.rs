//! Inbound listener
//!
//! Accepts peer connections on the worker's advertised port and hands every
//! data frame to the registered `MessageHandler`. A connection ends on the
//! stop sentinel, on EOF, or when the listener stops.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::net::frame::{self, Frame};

/// Receives payloads delivered to this worker
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: SocketAddr, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Handler that only traces what arrives
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_message(&self, from: SocketAddr, payload: Vec<u8>) -> anyhow::Result<()> {
        trace!(from = %from, bytes = payload.len(), "Message received");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Listening,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Stopped => write!(f, "stopped"),
            ListenerState::Listening => write!(f, "listening"),
        }
    }
}

/// A bound listener and its accept task
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start accepting.
    ///
    /// Every received data frame bumps `received` before the handler runs.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        received: Arc<AtomicU64>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ListenerBind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, handler, received, shutdown_rx));

        info!(addr = %local_addr, "Listener started");

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        if *self.shutdown_tx.borrow() || self.accept_task.is_finished() {
            ListenerState::Stopped
        } else {
            ListenerState::Listening
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    /// Stop accepting and signal every connection reader to exit.
    ///
    /// Returns false if the listener was already stopped.
    pub fn stop(&self) -> bool {
        let was_running = !self.shutdown_tx.send_replace(true);
        self.accept_task.abort();
        if was_running {
            info!(addr = %self.local_addr, "Listener stopped");
        }
        was_running
    }

    /// Stop, then wait for the accept task to release the socket
    pub async fn stop_and_wait(&mut self) -> bool {
        let was_running = self.stop();
        // A finished task has already dropped the socket
        if !self.accept_task.is_finished() {
            let _ = (&mut self.accept_task).await;
        }
        was_running
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    received: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Inbound endpoint connection");
                    tokio::spawn(read_loop(
                        stream,
                        peer_addr,
                        Arc::clone(&handler),
                        Arc::clone(&received),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn read_loop(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    received: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = frame::read_frame(&mut stream) => frame,
        };

        match frame {
            Ok(Some(Frame::Data(payload))) => {
                received.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handler.on_message(peer_addr, payload).await {
                    warn!(peer_addr = %peer_addr, error = %e, "Message handler failed");
                }
            }
            Ok(Some(Frame::Stop)) => {
                debug!(peer_addr = %peer_addr, "Peer closed endpoint");
                break;
            }
            Ok(None) => {
                debug!(peer_addr = %peer_addr, "Peer disconnected");
                break;
            }
            Err(e) => {
                warn!(peer_addr = %peer_addr, error = %e, "Endpoint read error");
                break;
            }
        }
    }
}
