//! Rotation packets sent by the phone.
//!
//! - `packet`: the 20-byte big-endian wire form and its normalization.
//! - `gate`: sequence-number staleness filter.

pub mod gate;
pub mod packet;

pub use gate::{DEFAULT_RESTART_THRESHOLD, SequenceGate};
pub use packet::{PACKET_LEN, PacketError, PosePacket};
