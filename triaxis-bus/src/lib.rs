//! Register-level bus abstraction for the triaxis accelerometer core
//!
//! This crate provides the hardware-facing seam the sensor core is built
//! against:
//!
//! - the [`RegisterBus`] trait (raw register reads/writes plus verified
//!   bulk configuration)
//! - the device register map and configuration tables
//! - raw sample block decoding
//! - an in-memory [`SimBus`] backend used by the core's tests
//!
//! ```text
//! [SimBus / real SPB backend]   ← implements RegisterBus (raw I/O)
//!            |
//!     [SensorController]        ← triaxis-sensor, mode + arbitration logic
//! ```

pub mod error;
pub mod registers;
pub mod sample;
pub mod sim;

pub use error::BusError;
pub use registers::{DataRate, RegisterSetting};
pub use sample::{RawSample, SCALE_G_PER_LSB};
pub use sim::SimBus;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

/// The core bus trait - all register backends implement this
///
/// Backends only need to provide raw sequential register reads and writes.
/// Multi-step sequences (disable interrupts, reprogram, re-enable) are
/// composed and serialized by the consumer; the bus itself is stateless
/// with respect to ordering.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Read `count` bytes starting at register `start`.
    ///
    /// The first byte comes from `start`, the second from `start + 1`, etc.
    async fn read_registers(&self, start: u8, count: usize) -> Result<Vec<u8>, BusError>;

    /// Write a buffer of bytes starting at register `start`.
    async fn write_registers(&self, start: u8, data: &[u8]) -> Result<(), BusError>;

    /// Program a table of register settings with read-back verification.
    ///
    /// Idempotent: applying the same table twice leaves the device in the
    /// same state. Each write is confirmed by reading the register back;
    /// a mismatch fails the whole configuration.
    async fn configure_registers(&self, settings: &[RegisterSetting]) -> Result<(), BusError> {
        for setting in settings {
            self.write_registers(setting.register, &[setting.value])
                .await?;

            let confirmed = self.read_registers(setting.register, 1).await?;
            let read_back = confirmed.first().copied().unwrap_or(0);

            if read_back != setting.value {
                return Err(BusError::VerifyMismatch {
                    register: setting.register,
                    wrote: setting.value,
                    read: read_back,
                });
            }

            debug!(
                "Configured register 0x{:02X} = 0x{:02X}",
                setting.register, setting.value
            );
        }

        Ok(())
    }
}

/// Type alias for a shared bus handle
pub type BoxedBus = Arc<dyn RegisterBus>;
