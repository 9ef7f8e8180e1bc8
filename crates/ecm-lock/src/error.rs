//! Error types for keyed locking.

use thiserror::Error;

/// Errors that can occur while acquiring a keyed lock.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be acquired within the configured timeout.
    #[error("Failed to acquire the lock on key {key}")]
    ConcurrentUpdate { key: String },

    /// The wait was interrupted (interrupt handle triggered or coordinator
    /// shut down).
    #[error("Interrupted while waiting for the lock on key {key}")]
    Interrupted { key: String },
}

impl LockError {
    /// The contended key.
    pub fn key(&self) -> &str {
        match self {
            Self::ConcurrentUpdate { key } | Self::Interrupted { key } => key,
        }
    }

    /// Timeouts may succeed on retry at a higher level; interruption is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate { .. })
    }
}

/// Convenience type alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
