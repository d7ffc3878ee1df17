//! Fan-out seam between the orchestrator and its workers

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::net::WorkerId;
use crate::protocol::{WorkerCommand, WorkerReply};

/// Delivers a command to one worker and returns its reply.
///
/// A worker-side failure comes back as `WorkerReply::Failed`; `Err` is
/// reserved for transport problems (worker gone, channel closed).
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Ids of every worker currently reachable
    fn workers(&self) -> Vec<WorkerId>;

    async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply>;
}

#[async_trait]
impl<T: ClusterTransport + ?Sized> ClusterTransport for Arc<T> {
    fn workers(&self) -> Vec<WorkerId> {
        (**self).workers()
    }

    async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply> {
        (**self).request(worker_id, command).await
    }
}

#[async_trait]
impl<T: ClusterTransport + ?Sized> ClusterTransport for &T {
    fn workers(&self) -> Vec<WorkerId> {
        (**self).workers()
    }

    async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply> {
        (**self).request(worker_id, command).await
    }
}
