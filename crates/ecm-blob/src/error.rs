use ecm_types::{ProviderId, TypeError};

/// Errors from blob store and blob provider operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The requested key does not exist in the backing store.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// No provider is registered under this id.
    #[error("no registered blob provider with id: {0}")]
    UnknownProvider(String),

    /// A provider with this id is already registered.
    #[error("duplicate blob provider: {0}")]
    DuplicateProvider(ProviderId),

    /// The key cannot be used by this store (path separators, dot segments).
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    /// Record-mode providers key content by document identity.
    #[error("record provider {0} requires an owning document")]
    RecordWithoutDocument(ProviderId),

    /// The stored content is under legal hold and cannot be overwritten or removed.
    #[error("blob {key} is under retention / hold")]
    Retained { key: String },

    /// A garbage collection is already running on this storage.
    #[error("binary garbage collection already in progress for {0}")]
    GcInProgress(String),

    /// `stop` was called on a collector that was never started.
    #[error("binary garbage collection not started for {0}")]
    GcNotStarted(String),

    /// Malformed managed blob key.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for blob operations.
pub type BlobResult<T> = Result<T, BlobError>;
