//! Execute a worker command against a local session

use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{WorkerCommand, WorkerReply};
use crate::session::WorkerSession;

/// Run `command` on `session`; failures become `WorkerReply::Failed`
pub async fn dispatch(session: &WorkerSession, command: WorkerCommand) -> WorkerReply {
    let name = command.name();
    debug!(worker = %session.worker_id(), command = name, "Executing command");

    match execute(session, command).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(worker = %session.worker_id(), command = name, error = %e.format_for_log(), "Command failed");
            WorkerReply::failed(&e)
        }
    }
}

async fn execute(session: &WorkerSession, command: WorkerCommand) -> Result<WorkerReply> {
    let reply = match command {
        WorkerCommand::AllocatePort { interface, claimed } => WorkerReply::PortAllocated {
            address: session.allocate_port_excluding(interface.as_deref(), &claimed)?,
        },
        WorkerCommand::SetAddresses { addresses } => WorkerReply::AddressesSet {
            entries: session.set_addresses(addresses),
        },
        WorkerCommand::StartListener => WorkerReply::ListenerStarted {
            address: session.start_listener().await?,
        },
        WorkerCommand::InitEndpoints => WorkerReply::EndpointsReady {
            connected: session.init_endpoints().await?,
        },
        WorkerCommand::Cleanup => WorkerReply::CleanedUp {
            report: session.cleanup().await,
        },
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommsConfig;

    #[tokio::test]
    async fn test_allocate_then_set() {
        let session = WorkerSession::new("w0", &CommsConfig::default());

        let command = WorkerCommand::AllocatePort {
            interface: None,
            claimed: Vec::new(),
        };
        let reply = dispatch(&session, command).await;
        let address = match reply {
            WorkerReply::PortAllocated { address } => address,
            other => panic!("unexpected reply {:?}", other),
        };
        assert!(address.in_allocation_range());

        let addresses = [("w0".to_string(), address)].into_iter().collect();
        let reply = dispatch(&session, WorkerCommand::SetAddresses { addresses }).await;
        assert_eq!(reply, WorkerReply::AddressesSet { entries: 1 });
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let session = WorkerSession::new("w0", &CommsConfig::default());

        let reply = dispatch(&session, WorkerCommand::InitEndpoints).await;
        assert!(matches!(reply, WorkerReply::Failed { code: 600, .. }));

        let reply = dispatch(
            &session,
            WorkerCommand::AllocatePort {
                interface: Some("no-such-iface0".into()),
                claimed: Vec::new(),
            },
        )
        .await;
        assert!(matches!(reply, WorkerReply::Failed { code: 300, .. }));
    }
}
