//! Port allocation
//!
//! Picks a random port in the allocation range, probes it by binding a
//! throwaway socket on loopback, and pairs the first free one with the
//! IPv4 address of the requested network interface.
//!
//! The probe releases its socket before returning, so another process can
//! still grab the port before the listener binds it. Callers that hit
//! `ListenerBind` should allocate again.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::Range;

use rand::Rng;
use tokio::net::TcpSocket;
use tracing::{debug, trace, warn};

use crate::config::NetworkSettings;
use crate::error::{Error, Result};

use super::address::{WorkerAddress, PORT_RANGE_MAX, PORT_RANGE_MIN};

/// Default bound on probe attempts before giving up
pub const DEFAULT_MAX_PROBE_ATTEMPTS: u32 = 1024;

/// Result of probing a single port
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Bind succeeded; the port was free at probe time
    Free,
    /// Bind failed with "address in use"
    InUse,
    /// Bind failed for any other reason
    Failed(io::Error),
}

impl ProbeOutcome {
    pub fn is_free(&self) -> bool {
        matches!(self, ProbeOutcome::Free)
    }
}

/// Probe whether `port` can be bound on 127.0.0.1 with address reuse enabled
pub fn probe_port(port: u16) -> ProbeOutcome {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

    let result = TcpSocket::new_v4().and_then(|socket| {
        socket.set_reuseaddr(true)?;
        socket.bind(addr)
    });

    match result {
        Ok(()) => ProbeOutcome::Free,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => ProbeOutcome::InUse,
        Err(e) => ProbeOutcome::Failed(e),
    }
}

/// Resolve the first IPv4 address bound to `interface`.
///
/// An empty name selects the default-route interface, then the loopback
/// interface when the host has no default route.
pub fn resolve_interface_ipv4(interface: &str) -> Result<Ipv4Addr> {
    if interface.is_empty() {
        return Ok(default_interface_ipv4());
    }

    netdev::get_interfaces()
        .into_iter()
        .find(|iface| iface.name == interface)
        .and_then(|iface| iface.ipv4.first().map(|net| net.addr()))
        .ok_or_else(|| Error::interface_unavailable(interface))
}

fn default_interface_ipv4() -> Ipv4Addr {
    if let Ok(iface) = netdev::get_default_interface() {
        if let Some(net) = iface.ipv4.first() {
            trace!(interface = %iface.name, "Using default-route interface");
            return net.addr();
        }
    }

    let loopback = netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_loopback())
        .find_map(|iface| iface.ipv4.first().map(|net| net.addr()));

    debug!("No default-route interface, falling back to loopback");
    loopback.unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Allocates a communication port for this worker
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PORT_RANGE_MIN..PORT_RANGE_MAX, DEFAULT_MAX_PROBE_ATTEMPTS)
    }
}

impl PortAllocator {
    /// Create an allocator over `range` (max exclusive).
    ///
    /// `max_attempts == 0` keeps drawing until a free port is found.
    pub fn new(range: Range<u16>, max_attempts: u32) -> Self {
        Self { range, max_attempts }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(settings.port_min..settings.port_max, settings.max_probe_attempts)
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    /// Resolve the interface address and find a free port for it
    pub fn allocate(&self, interface: &str) -> Result<WorkerAddress> {
        self.allocate_excluding(interface, &[])
    }

    /// Like `allocate`, but never hands out one of `claimed`.
    ///
    /// Used when re-allocating for a worker whose first address collided
    /// with a peer on the same host.
    pub fn allocate_excluding(
        &self,
        interface: &str,
        claimed: &[WorkerAddress],
    ) -> Result<WorkerAddress> {
        let ip = resolve_interface_ipv4(interface)?;
        let port = self.find_free_port_with(|port| {
            if claimed.contains(&WorkerAddress::new(ip, port)) {
                ProbeOutcome::InUse
            } else {
                probe_port(port)
            }
        })?;

        debug!(interface = %interface, ip = %ip, port, "Allocated worker address");
        Ok(WorkerAddress::new(ip, port))
    }

    /// Draw random ports until one probes free
    pub fn find_free_port(&self) -> Result<u16> {
        self.find_free_port_with(probe_port)
    }

    pub(crate) fn find_free_port_with<P>(&self, mut probe: P) -> Result<u16>
    where
        P: FnMut(u16) -> ProbeOutcome,
    {
        if self.range.is_empty() {
            return Err(Error::PortExhausted { attempts: 0 });
        }

        let mut rng = rand::thread_rng();
        let mut attempts: u32 = 0;

        loop {
            if self.max_attempts != 0 && attempts >= self.max_attempts {
                return Err(Error::PortExhausted { attempts });
            }
            attempts += 1;

            let port = rng.gen_range(self.range.clone());
            match probe(port) {
                ProbeOutcome::Free => {
                    trace!(port, attempts, "Port probe succeeded");
                    return Ok(port);
                }
                ProbeOutcome::InUse => {
                    trace!(port, "Port in use, drawing again");
                }
                ProbeOutcome::Failed(source) => {
                    let err = Error::PortProbe { port, source };
                    warn!(error = %err.format_for_log(), "Port probe failed, drawing again");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_detects_listening_port() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(matches!(probe_port(port), ProbeOutcome::InUse));

        drop(held);
    }

    #[test]
    fn test_find_free_port_in_range() {
        let allocator = PortAllocator::default();
        for _ in 0..16 {
            let port = allocator.find_free_port().unwrap();
            assert!((PORT_RANGE_MIN..PORT_RANGE_MAX).contains(&port));
        }
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let allocator = PortAllocator::default();
        let address = allocator.allocate("").unwrap();

        let listener = std::net::TcpListener::bind(("127.0.0.1", address.port()));
        assert!(listener.is_ok(), "port {} should be bindable", address.port());
    }

    #[test]
    fn test_exhaustion_when_only_port_is_taken() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new(port..port + 1, 5);
        match allocator.find_free_port() {
            Err(Error::PortExhausted { attempts }) => assert_eq!(attempts, 5),
            other => panic!("expected PortExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_probe_draws_again() {
        let allocator = PortAllocator::new(20000..20010, 10);
        let mut calls = 0;
        let port = allocator
            .find_free_port_with(|_| {
                calls += 1;
                if calls <= 3 {
                    ProbeOutcome::Failed(io::Error::from(io::ErrorKind::PermissionDenied))
                } else {
                    ProbeOutcome::Free
                }
            })
            .unwrap();

        assert_eq!(calls, 4);
        assert!((20000..20010).contains(&port));
    }

    #[test]
    fn test_failed_probes_count_toward_limit() {
        let allocator = PortAllocator::new(20000..20010, 4);
        let mut calls = 0;
        let result = allocator.find_free_port_with(|_| {
            calls += 1;
            ProbeOutcome::Failed(io::Error::from(io::ErrorKind::PermissionDenied))
        });

        assert!(matches!(result, Err(Error::PortExhausted { attempts: 4 })));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_claimed_addresses_are_skipped() {
        let ip = resolve_interface_ipv4("").unwrap();
        let allocator = PortAllocator::new(20850..20852, 64);
        let claimed = [WorkerAddress::new(ip, 20850)];

        for _ in 0..8 {
            let address = allocator.allocate_excluding("", &claimed).unwrap();
            assert_eq!(address.port(), 20851);
        }

        let all = [WorkerAddress::new(ip, 20850), WorkerAddress::new(ip, 20851)];
        assert!(matches!(
            allocator.allocate_excluding("", &all),
            Err(Error::PortExhausted { attempts: 64 })
        ));
    }

    #[test]
    fn test_empty_range_is_exhausted() {
        let allocator = PortAllocator::new(20000..20000, 0);
        assert!(matches!(
            allocator.find_free_port(),
            Err(Error::PortExhausted { attempts: 0 })
        ));
    }

    #[test]
    fn test_unknown_interface() {
        let err = resolve_interface_ipv4("no-such-iface0").unwrap_err();
        assert!(matches!(err, Error::InterfaceUnavailable { .. }));

        let allocator = PortAllocator::default();
        assert!(allocator.allocate("no-such-iface0").is_err());
    }

    #[test]
    fn test_default_interface_resolves() {
        assert!(resolve_interface_ipv4("").is_ok());
    }
}
