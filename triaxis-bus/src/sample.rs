//! Raw sample block decoding
//!
//! The device exposes one measurement as six sequential data registers
//! starting at DATA_X0: x, y, z as signed 16-bit little-endian values.

use zerocopy::little_endian::I16;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::BusError;

/// Length of one raw sample block in bytes
pub const SAMPLE_BLOCK_LEN: usize = 6;

/// Scale factor in full-resolution mode: 1 LSB = 1/256 g
pub const SCALE_G_PER_LSB: f64 = 1.0 / 256.0;

/// Wire layout of the six data registers
#[derive(FromBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
pub struct RawSample {
    pub x: I16,
    pub y: I16,
    pub z: I16,
}

impl RawSample {
    /// Decode a raw sample from a register read buffer.
    pub fn parse(bytes: &[u8]) -> Result<&Self, BusError> {
        RawSample::ref_from_bytes(bytes).map_err(|_| BusError::ShortRead {
            expected: SAMPLE_BLOCK_LEN,
            got: bytes.len(),
        })
    }

    /// Convert to acceleration in g, [x, y, z].
    pub fn to_g(&self) -> [f64; 3] {
        [
            f64::from(self.x.get()) * SCALE_G_PER_LSB,
            f64::from(self.y.get()) * SCALE_G_PER_LSB,
            f64::from(self.z.get()) * SCALE_G_PER_LSB,
        ]
    }
}
