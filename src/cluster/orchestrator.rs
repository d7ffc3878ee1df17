//! Cluster lifecycle orchestration
//!
//! Every operation fans one command out to all workers and waits for all of
//! them. A single failure fails the whole call; there is no partial result.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::try_join_all;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::{AddressMap, WorkerAddress, WorkerId};
use crate::protocol::{WorkerCommand, WorkerReply};
use crate::session::CleanupReport;

use super::transport::ClusterTransport;

/// Allocation rounds `listen` runs before giving up on distinct addresses
pub const MAX_ALLOCATION_ROUNDS: u32 = 4;

/// Drives listen / init / cleanup across every worker of a transport
pub struct ClusterLifecycleOrchestrator<T> {
    transport: T,
    fanout_timeout: Option<Duration>,
}

impl<T: ClusterTransport> ClusterLifecycleOrchestrator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            fanout_timeout: None,
        }
    }

    /// Bound each fan-out; `None` waits indefinitely
    pub fn with_fanout_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fanout_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Allocate a port on every worker and distribute the resulting map.
    ///
    /// `interface` overrides each worker's configured interface. Workers that
    /// come back with an address a peer already holds allocate again, with
    /// the held addresses excluded, for up to `MAX_ALLOCATION_ROUNDS`.
    pub async fn listen(&self, interface: Option<&str>) -> Result<AddressMap> {
        let workers = self.transport.workers();
        let mut addresses = self.allocate(&workers, interface, &[]).await?;

        let mut round = 1;
        loop {
            let colliding = colliding_workers(&addresses);
            if colliding.is_empty() {
                break;
            }
            if round >= MAX_ALLOCATION_ROUNDS {
                let worker_id = &colliding[0];
                let address = addresses[worker_id];
                let workers: Vec<_> = addresses
                    .iter()
                    .filter(|(_, a)| **a == address)
                    .map(|(id, _)| id.as_str())
                    .collect();
                return Err(Error::AddressCollision {
                    address,
                    workers: workers.join(", "),
                    rounds: round,
                });
            }

            warn!(round, workers = ?colliding, "Workers were allocated a peer's address, allocating again");
            let claimed: Vec<WorkerAddress> = addresses
                .iter()
                .filter(|(id, _)| !colliding.contains(id))
                .map(|(_, address)| *address)
                .collect();
            let reallocated = self.allocate(&colliding, interface, &claimed).await?;
            addresses.extend(reallocated);
            round += 1;
        }

        let replies = self
            .fan_out("set_addresses", |_| WorkerCommand::SetAddresses {
                addresses: addresses.clone(),
            })
            .await?;
        for (worker_id, reply) in &replies {
            match reply {
                WorkerReply::AddressesSet { entries } if *entries == addresses.len() => {}
                other => return Err(unexpected(worker_id, "set_addresses", other)),
            }
        }

        info!(workers = addresses.len(), "Cluster addresses distributed");
        Ok(addresses)
    }

    async fn allocate(
        &self,
        workers: &[WorkerId],
        interface: Option<&str>,
        claimed: &[WorkerAddress],
    ) -> Result<AddressMap> {
        let replies = self
            .fan_out_to("listen", workers, |_| WorkerCommand::AllocatePort {
                interface: interface.map(str::to_string),
                claimed: claimed.to_vec(),
            })
            .await?;

        replies
            .into_iter()
            .map(|(worker_id, reply)| match reply {
                WorkerReply::PortAllocated { address } => Ok((worker_id, address)),
                other => Err(unexpected(&worker_id, "allocate_port", &other)),
            })
            .collect()
    }

    /// Start every worker's inbound listener
    pub async fn start_listeners(&self) -> Result<BTreeMap<WorkerId, SocketAddr>> {
        let replies = self.fan_out("start_listeners", |_| WorkerCommand::StartListener).await?;

        replies
            .into_iter()
            .map(|(worker_id, reply)| match reply {
                WorkerReply::ListenerStarted { address } => Ok((worker_id, address)),
                other => Err(unexpected(&worker_id, "start_listener", &other)),
            })
            .collect()
    }

    /// Start listeners, then have every worker connect to all of its peers.
    ///
    /// Returns the number of peers each worker connected to.
    pub async fn init_endpoints(&self) -> Result<BTreeMap<WorkerId, usize>> {
        self.start_listeners().await?;
        let replies = self.fan_out("init_endpoints", |_| WorkerCommand::InitEndpoints).await?;

        replies
            .into_iter()
            .map(|(worker_id, reply)| match reply {
                WorkerReply::EndpointsReady { connected } => Ok((worker_id, connected)),
                other => Err(unexpected(&worker_id, "init_endpoints", &other)),
            })
            .collect()
    }

    /// Close every worker's endpoints and stop its listener
    pub async fn cleanup(&self) -> Result<BTreeMap<WorkerId, CleanupReport>> {
        let replies = self.fan_out("cleanup", |_| WorkerCommand::Cleanup).await?;

        let reports: BTreeMap<_, _> = replies
            .into_iter()
            .map(|(worker_id, reply)| match reply {
                WorkerReply::CleanedUp { report } => Ok((worker_id, report)),
                other => Err(unexpected(&worker_id, "cleanup", &other)),
            })
            .collect::<Result<_>>()?;

        info!(workers = reports.len(), "Cluster cleaned up");
        Ok(reports)
    }

    async fn fan_out<F>(&self, operation: &str, command: F) -> Result<BTreeMap<WorkerId, WorkerReply>>
    where
        F: Fn(&WorkerId) -> WorkerCommand,
    {
        let workers = self.transport.workers();
        self.fan_out_to(operation, &workers, command).await
    }

    async fn fan_out_to<F>(
        &self,
        operation: &str,
        workers: &[WorkerId],
        command: F,
    ) -> Result<BTreeMap<WorkerId, WorkerReply>>
    where
        F: Fn(&WorkerId) -> WorkerCommand,
    {
        debug!(operation, workers = workers.len(), "Fan-out");

        let calls = workers.iter().map(|worker_id| {
            let cmd = command(worker_id);
            async move {
                let reply = self
                    .transport
                    .request(worker_id, cmd)
                    .await
                    .map_err(|e| match e {
                        e @ Error::WorkerFailed { .. } => e,
                        other => Error::worker_failed(worker_id.as_str(), other.to_string()),
                    })?
                    .into_result(worker_id)?;
                Ok::<_, Error>((worker_id.clone(), reply))
            }
        });

        let replies = match self.fanout_timeout {
            Some(timeout) => tokio::time::timeout(timeout, try_join_all(calls))
                .await
                .map_err(|_| Error::FanOutTimeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })??,
            None => try_join_all(calls).await?,
        };

        Ok(replies.into_iter().collect())
    }
}

/// Every worker holding an address already held by a worker earlier in
/// id order
fn colliding_workers(addresses: &AddressMap) -> Vec<WorkerId> {
    let mut seen = HashSet::new();
    addresses
        .iter()
        .filter(|(_, address)| !seen.insert(**address))
        .map(|(worker_id, _)| worker_id.clone())
        .collect()
}

fn unexpected(worker_id: &str, operation: &str, reply: &WorkerReply) -> Error {
    Error::worker_failed(
        worker_id,
        format!("unexpected reply to {}: {:?}", operation, reply),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    /// Answers every command itself; `w1` can be made to fail or stall.
    ///
    /// With `shared_port` set, every worker is first handed the same port;
    /// `honor_claims` decides whether a re-allocation moves off it.
    struct ScriptedCluster {
        workers: Vec<WorkerId>,
        fail_on: Option<&'static str>,
        stall: bool,
        shared_port: Option<u16>,
        honor_claims: bool,
        allocations: Mutex<BTreeMap<WorkerId, usize>>,
    }

    impl ScriptedCluster {
        fn new(n: usize) -> Self {
            Self {
                workers: (0..n).map(|i| format!("w{}", i)).collect(),
                fail_on: None,
                stall: false,
                shared_port: None,
                honor_claims: true,
                allocations: Mutex::new(BTreeMap::new()),
            }
        }

        fn allocations(&self, worker_id: &str) -> usize {
            self.allocations.lock().get(worker_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ClusterTransport for ScriptedCluster {
        fn workers(&self) -> Vec<WorkerId> {
            self.workers.clone()
        }

        async fn request(&self, worker_id: &str, command: WorkerCommand) -> Result<WorkerReply> {
            if worker_id == "w1" {
                if self.stall {
                    std::future::pending::<()>().await;
                }
                if self.fail_on == Some(command.name()) {
                    return Ok(WorkerReply::Failed {
                        code: 300,
                        message: "no such interface".into(),
                    });
                }
            }

            let index: u16 = worker_id[1..].parse().unwrap();
            Ok(match command {
                WorkerCommand::AllocatePort { claimed, .. } => {
                    *self.allocations.lock().entry(worker_id.to_string()).or_default() += 1;
                    let port = match self.shared_port {
                        Some(port) if claimed.is_empty() || !self.honor_claims => port,
                        _ => 20000 + index,
                    };
                    WorkerReply::PortAllocated {
                        address: WorkerAddress::new(Ipv4Addr::LOCALHOST, port),
                    }
                }
                WorkerCommand::SetAddresses { addresses } => WorkerReply::AddressesSet {
                    entries: addresses.len(),
                },
                WorkerCommand::StartListener => WorkerReply::ListenerStarted {
                    address: SocketAddr::from(([0, 0, 0, 0], 20000 + index)),
                },
                WorkerCommand::InitEndpoints => WorkerReply::EndpointsReady {
                    connected: self.workers.len() - 1,
                },
                WorkerCommand::Cleanup => WorkerReply::CleanedUp {
                    report: CleanupReport::default(),
                },
            })
        }
    }

    #[tokio::test]
    async fn test_listen_assembles_map() {
        let orchestrator = ClusterLifecycleOrchestrator::new(ScriptedCluster::new(3));
        let map = orchestrator.listen(None).await.unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map["w2"].port(), 20002);
    }

    #[tokio::test]
    async fn test_listen_reallocates_colliding_workers() {
        let mut cluster = ScriptedCluster::new(3);
        cluster.shared_port = Some(20000);
        let orchestrator = ClusterLifecycleOrchestrator::new(cluster);

        let map = orchestrator.listen(None).await.unwrap();
        assert_eq!(map["w0"].port(), 20000);
        assert_eq!(map["w1"].port(), 20001);
        assert_eq!(map["w2"].port(), 20002);

        // The first holder of an address keeps it
        let cluster = orchestrator.transport();
        assert_eq!(cluster.allocations("w0"), 1);
        assert_eq!(cluster.allocations("w1"), 2);
        assert_eq!(cluster.allocations("w2"), 2);
    }

    #[tokio::test]
    async fn test_listen_gives_up_on_persistent_collision() {
        let mut cluster = ScriptedCluster::new(3);
        cluster.shared_port = Some(20000);
        cluster.honor_claims = false;
        let orchestrator = ClusterLifecycleOrchestrator::new(cluster);

        let err = orchestrator.listen(None).await.unwrap_err();
        match &err {
            Error::AddressCollision { address, workers, rounds } => {
                assert_eq!(address.port(), 20000);
                assert_eq!(workers, "w0, w1, w2");
                assert_eq!(*rounds, MAX_ALLOCATION_ROUNDS);
            }
            other => panic!("expected AddressCollision, got {:?}", other),
        }
        assert_eq!(err.code(), crate::error::ErrorCode::AddressCollision);
        assert_eq!(
            orchestrator.transport().allocations("w2"),
            MAX_ALLOCATION_ROUNDS as usize
        );
    }

    #[tokio::test]
    async fn test_listen_fails_when_one_worker_fails() {
        let mut cluster = ScriptedCluster::new(3);
        cluster.fail_on = Some("allocate_port");
        let orchestrator = ClusterLifecycleOrchestrator::new(cluster);

        match orchestrator.listen(Some("eth9")).await {
            Err(Error::WorkerFailed { worker_id, message }) => {
                assert_eq!(worker_id, "w1");
                assert!(message.contains("E300"));
            }
            other => panic!("expected WorkerFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fanout_timeout() {
        let mut cluster = ScriptedCluster::new(2);
        cluster.stall = true;
        let orchestrator = ClusterLifecycleOrchestrator::new(cluster)
            .with_fanout_timeout(Some(Duration::from_millis(50)));

        match orchestrator.cleanup().await {
            Err(Error::FanOutTimeout { operation, timeout_ms }) => {
                assert_eq!(operation, "cleanup");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected FanOutTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_init_endpoints_counts_peers() {
        let orchestrator = ClusterLifecycleOrchestrator::new(ScriptedCluster::new(4));
        let connected = orchestrator.init_endpoints().await.unwrap();

        assert_eq!(connected.len(), 4);
        assert!(connected.values().all(|n| *n == 3));
    }

    #[tokio::test]
    async fn test_empty_cluster() {
        let orchestrator = ClusterLifecycleOrchestrator::new(ScriptedCluster::new(0));
        assert!(orchestrator.listen(None).await.unwrap().is_empty());
        assert!(orchestrator.cleanup().await.unwrap().is_empty());
    }
}
