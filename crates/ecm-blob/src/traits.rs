use std::time::SystemTime;

use crate::error::BlobResult;

/// Listing entry of a stored binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlobInfo {
    pub key: String,
    pub size: u64,
    /// Last write time. Rewriting an existing key refreshes it.
    pub written_at: SystemTime,
}

/// Physical key/value storage for binaries.
///
/// All implementations must satisfy these invariants:
/// - `put` on an existing key replaces the content and refreshes its write
///   time, so a pending write is never mistaken for old garbage.
/// - Concurrent reads are always safe.
/// - The store never interprets contents or keys beyond validating them.
/// - All I/O errors are propagated, never silently ignored.
pub trait BlobStore: Send + Sync {
    /// Identity of the physical location. Two stores with the same id share
    /// storage.
    fn storage_id(&self) -> &str;

    /// Write `data` under `key`.
    fn put(&self, key: &str, data: &[u8]) -> BlobResult<()>;

    /// Read the content under `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> BlobResult<Option<Vec<u8>>>;

    /// Check whether a key exists.
    fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Delete a key. Returns `true` if it existed.
    ///
    /// Intended for garbage collection only.
    fn delete(&self, key: &str) -> BlobResult<bool>;

    /// List every stored key.
    fn list(&self) -> BlobResult<Vec<StoredBlobInfo>>;
}
