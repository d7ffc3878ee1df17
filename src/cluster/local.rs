//! In-process cluster
//!
//! Each worker gets its own `WorkerSession` and its own request loop on a
//! tokio task, so commands to one worker run sequentially while workers run
//! in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CommsConfig;
use crate::error::{Error, Result};
use crate::net::WorkerId;
use crate::protocol::{WorkerCommand, WorkerReply};
use crate::session::WorkerSession;

use super::dispatch::dispatch;
use super::transport::ClusterTransport;

const COMMAND_QUEUE_SIZE: usize = 16;

type LocalRequest = (WorkerCommand, oneshot::Sender<WorkerReply>);

struct LocalWorker {
    session: Arc<WorkerSession>,
    command_tx: mpsc::Sender<LocalRequest>,
    task: JoinHandle<()>,
}

/// Workers running as tasks inside this process
pub struct LocalCluster {
    workers: BTreeMap<WorkerId, LocalWorker>,
}

impl LocalCluster {
    /// Spawn one worker per id, each with a TCP-backed session
    pub fn spawn<I, S>(ids: I, config: &CommsConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkerId>,
    {
        Self::from_sessions(ids.into_iter().map(|id| WorkerSession::new(id, config)))
    }

    /// Spawn a worker loop for each prepared session
    pub fn from_sessions<I>(sessions: I) -> Self
    where
        I: IntoIterator<Item = WorkerSession>,
    {
        let workers = sessions
            .into_iter()
            .map(|session| {
                let session = Arc::new(session);
                let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
                let task = tokio::spawn(worker_loop(Arc::clone(&session), command_rx));
                let worker = LocalWorker {
                    session,
                    command_tx,
                    task,
                };
                (worker.session.worker_id().to_string(), worker)
            })
            .collect::<BTreeMap<_, _>>();

        info!(workers = workers.len(), "Local cluster started");
        Self { workers }
    }

    /// Session of `worker_id`, for application code running on that worker
    pub fn session(&self, worker_id: &str) -> Option<Arc<WorkerSession>> {
        self.workers.get(worker_id).map(|w| Arc::clone(&w.session))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker loop and wait for its teardown to finish
    pub async fn shutdown(self) {
        let tasks: Vec<_> = self
            .workers
            .into_values()
            .map(|worker| {
                drop(worker.command_tx);
                worker.task
            })
            .collect();

        for task in tasks {
            let _ = task.await;
        }
        info!("Local cluster stopped");
    }
}

async fn worker_loop(session: Arc<WorkerSession>, mut command_rx: mpsc::Receiver<LocalRequest>) {
    session
        .run_scoped(async {
            while let Some((command, reply_tx)) = command_rx.recv().await {
                let reply = dispatch(&session, command).await;
                let _ = reply_tx.send(reply);
            }
        })
        .await;
    debug!(worker = %session.worker_id(), "Worker loop exited");
}

#[async_trait]
impl ClusterTransport for LocalCluster {
    fn workers(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply> {
        let worker = self.workers.get(worker_id).ok_or_else(|| Error::UnknownWorker {
            worker_id: worker_id.to_string(),
        })?;
        let unavailable = || Error::WorkerUnavailable {
            worker_id: worker_id.to_string(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .command_tx
            .send((command, reply_tx))
            .await
            .map_err(|_| unavailable())?;
        reply_rx.await.map_err(|_| unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reaches_worker() {
        let cluster = LocalCluster::spawn(["a", "b"], &CommsConfig::default());
        assert_eq!(cluster.workers(), vec!["a".to_string(), "b".to_string()]);

        let command = WorkerCommand::AllocatePort {
            interface: None,
            claimed: Vec::new(),
        };
        let reply = cluster.request("b", command).await.unwrap();
        assert!(matches!(reply, WorkerReply::PortAllocated { .. }));
        assert!(cluster.session("b").unwrap().local_address().is_some());
        assert!(cluster.session("a").unwrap().local_address().is_none());

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let cluster = LocalCluster::spawn(["a"], &CommsConfig::default());
        let err = cluster.request("zz", WorkerCommand::Cleanup).await.unwrap_err();
        assert!(matches!(err, Error::UnknownWorker { .. }));
        cluster.shutdown().await;
    }
}
