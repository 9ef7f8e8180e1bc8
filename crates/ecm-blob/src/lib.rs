//! Blob storage for the ECM document core.
//!
//! Three layers, bottom-up:
//!
//! - [`BlobStore`] — physical key/value storage for binaries
//!   ([`InMemoryBlobStore`], [`FileSystemBlobStore`])
//! - [`BlobProvider`] — a named backend over a store that decides storage
//!   keys: content digest for regular providers, owning document id for
//!   record-mode providers ([`StoreBlobProvider`])
//! - [`ProviderRegistry`] — the explicit set of providers of one process
//!
//! Each durable provider owns a [`BinaryGarbageCollector`]; collectors with
//! the same id sweep the same physical storage.
//!
//! # Design Rules
//!
//! 1. Stores never interpret keys or content.
//! 2. Rewriting a key refreshes its write time; GC honors a minimum age.
//! 3. Record-mode providers refuse to overwrite or delete retained keys, and
//!    stage transactional writes until the transaction commits.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod blob;
pub mod error;
pub mod fs;
pub mod gc;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod retention;
pub mod traits;

pub use blob::{content_digest, Blob, BlobSource, ManagedRef};
pub use error::{BlobError, BlobResult};
pub use fs::FileSystemBlobStore;
pub use gc::{BinaryGarbageCollector, BinaryManagerStatus};
pub use memory::InMemoryBlobStore;
pub use provider::{
    record_key, BlobContext, BlobProvider, ProviderDescriptor, StoreBlobProvider, MAIN_BLOB_XPATH,
};
pub use registry::ProviderRegistry;
pub use retention::Retention;
pub use traits::{BlobStore, StoredBlobInfo};
