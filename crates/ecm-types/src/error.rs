use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid provider id: {0:?}")]
    InvalidProviderId(String),

    #[error("invalid blob key: {0:?}")]
    InvalidBlobKey(String),

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
}
