//! Remote cluster: worker agents connected over WebSocket
//!
//! Agents dial the orchestrator, send `REGISTER` with their worker id and
//! receive `REGISTER_ACK`. Commands go out as `REQUEST` messages carrying a
//! fresh request id; the matching `RESPONSE` is routed back to the waiting
//! caller through the pending-request table.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClusterSettings;
use crate::error::{Error, Result};
use crate::net::WorkerId;
use crate::protocol::{
    ControlRequest, Message, MessageEnvelope, RegisterAckResponse, ShutdownMessage, WorkerCommand,
    WorkerReply, PROTOCOL_VERSION,
};

use super::transport::ClusterTransport;

/// How long `shutdown` waits for agents to disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────

struct AgentHandle {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

struct PendingRequest {
    worker_id: WorkerId,
    reply_tx: oneshot::Sender<WorkerReply>,
}

struct ServerState {
    agents: RwLock<BTreeMap<WorkerId, AgentHandle>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    registered: watch::Sender<usize>,
    register_timeout: Duration,
}

impl ServerState {
    /// Register an agent; false if the worker id is already connected
    fn register(&self, worker_id: &str, handle: AgentHandle) -> bool {
        let mut agents = self.agents.write();
        if agents.contains_key(worker_id) {
            return false;
        }
        agents.insert(worker_id.to_string(), handle);
        self.registered.send_replace(agents.len());
        true
    }

    /// Remove an agent connection and fail whatever it still owed us
    fn unregister(&self, worker_id: &str, connection_id: Uuid) {
        {
            let mut agents = self.agents.write();
            if agents
                .get(worker_id)
                .is_some_and(|a| a.connection_id == connection_id)
            {
                agents.remove(worker_id);
                self.registered.send_replace(agents.len());
            }
        }

        // Dropping the reply senders wakes the waiters with WorkerUnavailable
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.worker_id != worker_id);
        let failed = before - pending.len();
        if failed > 0 {
            warn!(worker = %worker_id, failed, "Agent disconnected with requests in flight");
        }
    }

    fn complete(&self, worker_id: &str, request_id: Uuid, reply: WorkerReply) {
        let mut pending = self.pending.lock();
        match pending.get(&request_id) {
            Some(p) if p.worker_id == worker_id => {
                if let Some(p) = pending.remove(&request_id) {
                    let _ = p.reply_tx.send(reply);
                }
            }
            Some(_) => warn!(worker = %worker_id, %request_id, "Response from the wrong worker"),
            None => debug!(worker = %worker_id, %request_id, "Response for unknown request"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Remote Cluster
// ─────────────────────────────────────────────────────────────────

/// Orchestrator-side endpoint that worker agents connect to
pub struct RemoteCluster {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl RemoteCluster {
    /// Bind the control listener and start accepting agents
    pub async fn bind(addr: SocketAddr, settings: &ClusterSettings) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ListenerBind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (registered, _) = watch::channel(0);
        let state = Arc::new(ServerState {
            agents: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            registered,
            register_timeout: settings.register_timeout(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        info!(addr = %local_addr, "Orchestrator listening for agents");

        Ok(Self {
            local_addr,
            state,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered agents
    pub fn worker_count(&self) -> usize {
        self.state.agents.read().len()
    }

    /// Wait until at least `count` agents are registered
    pub async fn wait_for_workers(&self, count: usize, timeout: Duration) -> Result<Vec<WorkerId>> {
        let mut registered = self.state.registered.subscribe();

        tokio::time::timeout(timeout, registered.wait_for(|n| *n >= count))
            .await
            .map_err(|_| Error::FanOutTimeout {
                operation: format!("wait_for_workers({})", count),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|_| Error::Internal("registration channel closed".to_string()))?;

        Ok(self.workers())
    }

    /// Tell every agent to exit, stop accepting new ones and wait briefly
    /// for the connected agents to hang up
    pub async fn shutdown(&self, reason: &str) {
        self.accept_task.abort();

        let message = Message::Shutdown(ShutdownMessage {
            reason: reason.to_string(),
        });
        let notified = {
            let agents = self.state.agents.read();
            for (worker_id, agent) in agents.iter() {
                match encode(message.clone()) {
                    Ok(frame) => {
                        let _ = agent.outbound.send(frame);
                    }
                    Err(e) => warn!(worker = %worker_id, error = %e, "Failed to encode shutdown"),
                }
            }
            agents.len()
        };

        let mut registered = self.state.registered.subscribe();
        let drained = matches!(
            tokio::time::timeout(SHUTDOWN_GRACE, registered.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if !drained {
            warn!(remaining = self.worker_count(), "Agents still connected after shutdown");
        }
        info!(agents = notified, reason, "Orchestrator shut down");
    }
}

impl Drop for RemoteCluster {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl ClusterTransport for RemoteCluster {
    fn workers(&self) -> Vec<WorkerId> {
        self.state.agents.read().keys().cloned().collect()
    }

    async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply> {
        let request_id = Uuid::new_v4();
        let frame = encode(Message::Request(ControlRequest {
            request_id,
            command,
        }))?;
        let unavailable = || Error::WorkerUnavailable {
            worker_id: worker_id.to_string(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let agents = self.state.agents.read();
            let agent = agents.get(worker_id).ok_or_else(unavailable)?;
            self.state.pending.lock().insert(
                request_id,
                PendingRequest {
                    worker_id: worker_id.to_string(),
                    reply_tx,
                },
            );
            if agent.outbound.send(frame).is_err() {
                self.state.pending.lock().remove(&request_id);
                return Err(unavailable());
            }
        }

        reply_rx.await.map_err(|_| unavailable())
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Handling
// ─────────────────────────────────────────────────────────────────

fn encode(message: Message) -> Result<WsMessage> {
    Ok(WsMessage::Text(MessageEnvelope::new(message).to_json()?))
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_agent(state, stream, peer_addr).await {
                        warn!(peer_addr = %peer_addr, error = %e, "Agent connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_agent(state: Arc<ServerState>, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let envelope = tokio::time::timeout(state.register_timeout, next_envelope(&mut read))
        .await
        .map_err(|_| Error::protocol("agent did not register in time"))??
        .ok_or_else(|| Error::protocol("agent disconnected before registering"))?;

    let request = match envelope.payload {
        Message::Register(request) => request,
        other => {
            return Err(Error::protocol(format!(
                "expected REGISTER, got {}",
                other.type_name()
            )))
        }
    };
    let worker_id = request.worker_id;

    if let Err(e) = PROTOCOL_VERSION.check_peer(&envelope.version) {
        write.send(ack(Some(e.to_string()))?).await?;
        return Err(e);
    }

    let connection_id = Uuid::new_v4();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    if !state.register(&worker_id, AgentHandle { connection_id, outbound }) {
        let reason = format!("worker id '{}' is already registered", worker_id);
        write.send(ack(Some(reason.clone()))?).await?;
        return Err(Error::RegistrationFailed { message: reason });
    }

    // The ack must precede any request queued once the agent is visible
    if let Err(e) = write.send(ack(None)?).await {
        state.unregister(&worker_id, connection_id);
        return Err(e.into());
    }
    info!(worker = %worker_id, peer_addr = %peer_addr, agent_version = %request.agent_version, "Agent registered");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write.send(frame).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let result = read_responses(&state, &worker_id, &mut read).await;

    state.unregister(&worker_id, connection_id);
    writer.abort();
    info!(worker = %worker_id, "Agent disconnected");
    result
}

async fn read_responses<R>(state: &ServerState, worker_id: &str, read: &mut R) -> Result<()>
where
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    while let Some(envelope) = next_envelope(read).await? {
        match envelope.payload {
            Message::Response(response) => {
                state.complete(worker_id, response.request_id, response.reply);
            }
            Message::Shutdown(msg) => {
                info!(worker = %worker_id, reason = %msg.reason, "Agent is shutting down");
                break;
            }
            Message::Error(err) => {
                warn!(worker = %worker_id, code = err.code, fatal = err.fatal, message = %err.message, "Agent reported error");
            }
            other => {
                warn!(worker = %worker_id, msg_type = other.type_name(), "Unexpected message from agent");
            }
        }
    }
    Ok(())
}

fn ack(error: Option<String>) -> Result<WsMessage> {
    encode(Message::RegisterAck(RegisterAckResponse {
        success: error.is_none(),
        error,
    }))
}

/// Next protocol envelope, or `None` once the peer closes
pub(crate) async fn next_envelope<R>(read: &mut R) -> Result<Option<MessageEnvelope>>
where
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg? {
            WsMessage::Text(text) => return MessageEnvelope::from_json(&text).map(Some),
            WsMessage::Binary(data) => {
                let text = std::str::from_utf8(&data)
                    .map_err(|e| Error::protocol(format!("binary frame is not UTF-8: {}", e)))?;
                return MessageEnvelope::from_json(text).map(Some);
            }
            WsMessage::Close(frame) => {
                debug!(frame = ?frame, "Received close frame");
                return Ok(None);
            }
            _ => {}
        }
    }
    Ok(None)
}
