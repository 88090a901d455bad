//! UDP primitives for the pose receiver.
//!
//! mio-based, non-blocking; readiness comes from a `mio::Poll` owned by the
//! receiving thread.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
