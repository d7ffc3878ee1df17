//! Addresses, port allocation and wire framing

pub mod address;
pub mod frame;
pub mod port;

pub use address::{AddressMap, WorkerAddress, WorkerId, PORT_RANGE_MAX, PORT_RANGE_MIN};
pub use frame::{Frame, MAX_FRAME_SIZE};
pub use port::{probe_port, resolve_interface_ipv4, PortAllocator, ProbeOutcome};
