//! Error types for pools, work threads and processing engines

use std::time::Duration;
use thiserror::Error;

/// Error raised by collaborator code: factories, receivers and processors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool '{pool}' has reached max capacity {max}")]
    CapacityExceeded { pool: String, max: usize },

    #[error("Pool '{pool}' failed to allocate object")]
    AllocationFailed { pool: String },

    #[error("'{0}' is closed")]
    Closed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("'{0}' is corrupted")]
    Corrupted(String),

    #[error("Invalid state: expected '{expected}' actual '{actual}'")]
    InvalidState { expected: String, actual: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Work thread '{0}' is stopped")]
    ThreadStopped(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Whether the error is a missed deadline rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout(_))
    }
}
