//! Sensor core error types

use thiserror::Error;
use triaxis_bus::BusError;

/// Errors from sensor core operations
///
/// `Clone` is derived because batch operations return per-key result maps
/// that carry individual errors alongside successes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// Bad input shape or range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown client or key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Protocol violation (double-subscribe, not started, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Register I/O or verification failure
    #[error("Hardware failure: {0}")]
    Hardware(#[from] BusError),

    /// Allocation or capacity limit hit
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Property key exists but is not settable / not known here
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Batch operation where some items succeeded and some failed
    #[error("Partial failure: some items in the batch failed")]
    PartialFailure,

    /// Non-recoverable internal-state inconsistency
    #[error("Internal state error: {0}")]
    Internal(String),
}
