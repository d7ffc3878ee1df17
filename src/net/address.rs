//! Worker address types
//!
//! A worker is reachable at exactly one `ip:port` pair for the lifetime of a
//! cluster session. The cluster-wide view is an ordered map from worker id to
//! address so every worker's copy serializes identically.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lowest port handed out by the allocator (inclusive)
pub const PORT_RANGE_MIN: u16 = 10000;

/// Upper bound of the allocator's port range (exclusive)
pub const PORT_RANGE_MAX: u16 = 32000;

/// Identifier of a worker in the cluster
pub type WorkerId = String;

/// Cluster address map: worker id → advertised address
pub type AddressMap = BTreeMap<WorkerId, WorkerAddress>;

/// Network location of a worker's communication listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerAddress {
    ip: Ipv4Addr,
    port: u16,
}

impl WorkerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Socket address used to connect to this worker
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Whether the port lies in the default allocation range
    pub fn in_allocation_range(&self) -> bool {
        (PORT_RANGE_MIN..PORT_RANGE_MAX).contains(&self.port)
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for WorkerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s.parse()?;
        Ok(Self::new(*addr.ip(), addr.port()))
    }
}

impl From<SocketAddrV4> for WorkerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}
