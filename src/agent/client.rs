//! Worker agent: the worker side of the orchestrator control channel
//!
//! Handles:
//! - Connecting to the orchestrator over WebSocket
//! - Registration with the worker id
//! - Executing lifecycle commands in arrival order
//! - Automatic reconnection with exponential backoff

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cluster::{dispatch, next_envelope};
use crate::config::ClusterSettings;
use crate::error::{Error, Result};
use crate::protocol::{ControlResponse, Message, MessageEnvelope, RegisterRequest};
use crate::session::WorkerSession;
use crate::version;

/// Upper bound between reconnection attempts
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Reconnecting,
    ShuttingDown,
}

/// How a served connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentExit {
    /// Orchestrator asked us to stop
    Shutdown,
    /// Socket went away; reconnect
    Disconnected,
}

/// Serves lifecycle commands for one worker session
pub struct WorkerAgent {
    session: Arc<WorkerSession>,
    url: Url,
    settings: ClusterSettings,
    state: RwLock<ConnectionState>,
}

impl WorkerAgent {
    pub fn new(session: Arc<WorkerSession>, settings: &ClusterSettings) -> Result<Self> {
        let url = Url::parse(&settings.orchestrator_url).map_err(|e| {
            Error::config_field_invalid(
                "cluster.orchestrator_url",
                format!("invalid URL '{}': {}", settings.orchestrator_url, e),
            )
        })?;

        Ok(Self {
            session,
            url,
            settings: settings.clone(),
            state: RwLock::new(ConnectionState::Disconnected),
        })
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Serve until the orchestrator sends `SHUTDOWN`
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until the orchestrator sends `SHUTDOWN` or `signal` resolves.
    ///
    /// The session is torn down on every exit path.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = self
            .session
            .run_scoped(async {
                tokio::select! {
                    result = self.connect_loop() => result,
                    _ = signal => {
                        info!(worker = %self.session.worker_id(), "Shutdown signal received");
                        Ok(())
                    }
                }
            })
            .await;

        self.set_state(ConnectionState::ShuttingDown);
        info!(worker = %self.session.worker_id(), "Agent stopped");
        result
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    async fn connect_loop(&self) -> Result<()> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.reconnect_interval(),
            max_interval: MAX_RECONNECT_DELAY,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.url, "Connecting to orchestrator");

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _response)) => {
                    backoff.reset();
                    attempts = 0;
                    self.set_state(ConnectionState::Connected);

                    let (write, read) = ws_stream.split();
                    match self.serve(write, read).await {
                        Ok(AgentExit::Shutdown) => return Ok(()),
                        Ok(AgentExit::Disconnected) => {
                            warn!("Orchestrator closed the connection");
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e.format_for_log(), "Fatal control channel error");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(error = %e, "Connection error");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to orchestrator");
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            attempts += 1;

            let max = self.settings.max_reconnect_attempts;
            if max > 0 && attempts >= max {
                error!(attempts, max, "Max reconnection attempts reached");
                return Err(Error::ConnectionLost {
                    address: self.url.to_string(),
                    message: format!("gave up after {} reconnection attempts", attempts),
                });
            }

            let delay = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempts,
                "Waiting before reconnection"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Register, then execute requests until the connection ends
    async fn serve<S, R>(&self, mut write: S, mut read: R) -> Result<AgentExit>
    where
        S: Sink<WsMessage, Error = WsError> + Unpin,
        R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        let worker_id = self.session.worker_id().to_string();
        let hostname = hostname::get().ok().and_then(|h| h.into_string().ok());

        send_message(
            &mut write,
            Message::Register(RegisterRequest {
                worker_id: worker_id.clone(),
                agent_version: version::build_info().full_version(),
                hostname,
            }),
        )
        .await?;
        self.wait_for_registration(&mut read).await?;

        self.set_state(ConnectionState::Registered);
        info!(worker = %worker_id, "Registered with orchestrator");

        while let Some(envelope) = next_envelope(&mut read).await? {
            match envelope.payload {
                Message::Request(request) => {
                    let reply = dispatch(&self.session, request.command).await;
                    send_message(
                        &mut write,
                        Message::Response(ControlResponse {
                            request_id: request.request_id,
                            reply,
                        }),
                    )
                    .await?;
                }
                Message::Shutdown(msg) => {
                    info!(reason = %msg.reason, "Orchestrator requested shutdown");
                    let _ = write.close().await;
                    return Ok(AgentExit::Shutdown);
                }
                Message::Error(err) if err.fatal => {
                    error!(code = err.code, message = %err.message, "Fatal error from orchestrator");
                    return Ok(AgentExit::Shutdown);
                }
                Message::Error(err) => {
                    warn!(code = err.code, message = %err.message, "Error from orchestrator");
                }
                other => {
                    debug!(msg_type = other.type_name(), "Ignoring unexpected message");
                }
            }
        }

        Ok(AgentExit::Disconnected)
    }

    async fn wait_for_registration<R>(&self, read: &mut R) -> Result<()>
    where
        R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        let timeout = self.settings.register_timeout();
        let envelope = tokio::time::timeout(timeout, next_envelope(read))
            .await
            .map_err(|_| Error::ConnectionTimeout {
                address: self.url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })??
            .ok_or_else(|| Error::ConnectionLost {
                address: self.url.to_string(),
                message: "closed during registration".to_string(),
            })?;

        match envelope.payload {
            Message::RegisterAck(ack) if ack.success => Ok(()),
            Message::RegisterAck(ack) => Err(Error::RegistrationFailed {
                message: ack.error.unwrap_or_else(|| "Unknown error".to_string()),
            }),
            Message::Error(err) => Err(Error::RegistrationFailed {
                message: err.message,
            }),
            other => Err(Error::protocol(format!(
                "expected REGISTER_ACK, got {}",
                other.type_name()
            ))),
        }
    }
}

async fn send_message<S>(write: &mut S, msg: Message) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let json = MessageEnvelope::new(msg).to_json()?;
    write.send(WsMessage::Text(json)).await?;
    Ok(())
}
