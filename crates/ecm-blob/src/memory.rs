use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::error::BlobResult;
use crate::traits::{BlobStore, StoredBlobInfo};

struct Entry {
    data: Vec<u8>,
    written_at: SystemTime,
}

/// In-memory, HashMap-based blob store.
///
/// Intended for tests and embedding. Content is held behind a `RwLock` for
/// safe concurrent access and cloned on read. Share one instance (behind an
/// `Arc`) between providers to model shared physical storage.
pub struct InMemoryBlobStore {
    storage_id: String,
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryBlobStore {
    /// Create a new empty store. `name` becomes part of the storage id.
    pub fn new(name: &str) -> Self {
        Self {
            storage_id: format!("memory:{name}"),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored binaries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored binaries.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .read()
            .expect("lock poisoned")
            .values()
            .map(|e| e.data.len() as u64)
            .sum()
    }

    /// Sorted list of all keys.
    pub fn keys(&self) -> Vec<String> {
        let map = self.entries.read().expect("lock poisoned");
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for InMemoryBlobStore {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn put(&self, key: &str, data: &[u8]) -> BlobResult<()> {
        let mut map = self.entries.write().expect("lock poisoned");
        map.insert(
            key.to_string(),
            Entry {
                data: data.to_vec(),
                written_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(map.get(key).map(|e| e.data.clone()))
    }

    fn exists(&self, key: &str) -> BlobResult<bool> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(map.contains_key(key))
    }

    fn delete(&self, key: &str) -> BlobResult<bool> {
        let mut map = self.entries.write().expect("lock poisoned");
        Ok(map.remove(key).is_some())
    }

    fn list(&self) -> BlobResult<Vec<StoredBlobInfo>> {
        let map = self.entries.read().expect("lock poisoned");
        let mut infos: Vec<StoredBlobInfo> = map
            .iter()
            .map(|(key, e)| StoredBlobInfo {
                key: key.clone(),
                size: e.data.len() as u64,
                written_at: e.written_at,
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

impl std::fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("storage_id", &self.storage_id)
            .field("blob_count", &self.len())
            .finish()
    }
}
