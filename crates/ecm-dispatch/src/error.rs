use ecm_blob::BlobError;
use ecm_types::TypeError;

/// Errors raised while routing, writing and collecting document blobs.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Dispatcher or provider configuration is malformed. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The document is under retention or legal hold.
    #[error("{0}")]
    SecurityViolation(String),

    /// The operation cannot run while providers share storage.
    #[error("Cannot perform delete on shared storage.")]
    SharedStorage,

    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DispatchError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
