//! Wire format of a rotation packet.
//!
//! | Offset | Field | Type          |
//! |--------|-------|---------------|
//! | 0      | w     | f32, big-endian |
//! | 4      | x     | f32, big-endian |
//! | 8      | y     | f32, big-endian |
//! | 12     | z     | f32, big-endian |
//! | 16     | seq   | i32, big-endian |
//!
//! Byte order is fixed regardless of either host's endianness.

use glam::Quat;
use thiserror::Error;

/// Exact size of a rotation packet in bytes.
pub const PACKET_LEN: usize = 20;

/// Errors while turning a datagram into a usable rotation.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PacketError {
    /// Datagram is not exactly [`PACKET_LEN`] bytes.
    #[error("pose packet must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    /// Quaternion is all zero or has an infinite or NaN component.
    #[error("quaternion with norm {norm} cannot be normalized")]
    Degenerate { norm: f32 },
}

/// A decoded rotation packet. Components are raw, not yet normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosePacket {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub seq: i32,
}

struct PacketReader<'a> {
    buf: &'a [u8; PACKET_LEN],
    cursor: usize,
}

impl<'a> PacketReader<'a> {
    const fn new(buf: &'a [u8; PACKET_LEN]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take_be<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        bytes
    }

    fn take_f32(&mut self) -> f32 {
        f32::from_be_bytes(self.take_be())
    }

    fn take_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take_be())
    }
}

impl PosePacket {
    /// Builds a packet carrying `rotation` as-is.
    #[must_use]
    pub fn from_rotation(rotation: Quat, seq: i32) -> Self {
        Self {
            w: rotation.w,
            x: rotation.x,
            y: rotation.y,
            z: rotation.z,
            seq,
        }
    }

    /// Decodes one datagram.
    ///
    /// # Errors
    ///
    /// [`PacketError::Length`] unless `datagram` is exactly [`PACKET_LEN`] bytes.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        let buf: &[u8; PACKET_LEN] = datagram.try_into().map_err(|_| PacketError::Length {
            expected: PACKET_LEN,
            actual: datagram.len(),
        })?;

        let mut reader = PacketReader::new(buf);
        Ok(Self {
            w: reader.take_f32(),
            x: reader.take_f32(),
            y: reader.take_f32(),
            z: reader.take_f32(),
            seq: reader.take_i32(),
        })
    }

    /// Encodes into wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut out = [0u8; PACKET_LEN];
        out[0..4].copy_from_slice(&self.w.to_be_bytes());
        out[4..8].copy_from_slice(&self.x.to_be_bytes());
        out[8..12].copy_from_slice(&self.y.to_be_bytes());
        out[12..16].copy_from_slice(&self.z.to_be_bytes());
        out[16..20].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    /// The carried rotation scaled to unit length.
    ///
    /// # Errors
    ///
    /// [`PacketError::Degenerate`] if a component is not finite or all are zero.
    pub fn rotation(&self) -> Result<Quat, PacketError> {
        // f64 holds the square of any finite f32, so no nonzero norm is lost.
        let raw = Quat::from_xyzw(self.x, self.y, self.z, self.w).as_dquat();
        let norm = raw.length();
        if !raw.is_finite() || norm == 0.0 {
            return Err(PacketError::Degenerate { norm: norm as f32 });
        }
        Ok((raw / norm).as_quat())
    }
}
