//! Bus error types

use thiserror::Error;

/// Errors that can occur during register bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Underlying transfer failed (SPI/I2C transaction error)
    #[error("Bus I/O error: {0}")]
    Io(String),

    /// Register address outside the device's register file
    #[error("Invalid register address 0x{register:02X}")]
    InvalidAddress { register: u8 },

    /// Read returned fewer bytes than requested
    #[error("Short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// Read-back after a configuration write did not match
    #[error("Register 0x{register:02X} verify mismatch: wrote 0x{wrote:02X}, read 0x{read:02X}")]
    VerifyMismatch { register: u8, wrote: u8, read: u8 },

    /// Device no longer reachable
    #[error("Device disconnected")]
    Disconnected,
}
