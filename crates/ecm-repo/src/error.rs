use std::time::Duration;

use ecm_dispatch::DispatchError;
use ecm_lock::LockError;
use ecm_types::TransactionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status classification of a [`RepoError::Conflict`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Conflict,
    NotFound,
}

impl ConflictStatus {
    /// HTTP-style status code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Conflict => 409,
            Self::NotFound => 404,
        }
    }
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("{message}")]
    Conflict {
        status: ConflictStatus,
        message: String,
    },

    /// Unique `(parent, name)` violation detected at commit.
    #[error("concurrent update: {0}")]
    ConcurrentUpdate(String),

    #[error("transaction {id} timed out after {timeout:?}")]
    TransactionTimeout { id: TransactionId, timeout: Duration },

    #[error("transaction {0} is no longer active")]
    TransactionInactive(TransactionId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RepoError {
    pub fn conflict(status: ConflictStatus, message: impl Into<String>) -> Self {
        Self::Conflict {
            status,
            message: message.into(),
        }
    }

    /// Lock timeouts and commit-time unique violations; the caller may retry.
    pub fn is_concurrent_update(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentUpdate(_) | Self::Lock(LockError::ConcurrentUpdate { .. })
        )
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Dispatch(DispatchError::SecurityViolation(_)))
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
