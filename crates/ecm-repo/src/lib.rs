//! In-memory document repository for the ECM document core.
//!
//! Provides the collaborators the blob dispatch core runs inside:
//! transactions with timeouts, sessions with staged writes, documents with
//! versions, records and legal hold, and the lock-protected
//! [`Repository::get_or_create_document`] flow. Every blob a session writes
//! goes through [`ecm_dispatch::DocumentBlobManager::write_blob`], and the
//! repository reports its live blob keys for garbage collection.

pub mod document;
pub mod error;
pub mod repository;
pub mod session;
pub mod tx;

pub use document::{Document, VersionInfo};
pub use error::{ConflictStatus, RepoError, RepoResult};
pub use repository::{GetOrCreate, Repository, RepositoryConfig};
pub use session::{MakeRecord, Session};
pub use tx::{Transaction, TransactionManager, TransactionStatus, DEFAULT_TRANSACTION_TIMEOUT};
