use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ecm_types::{DocumentId, ProviderId, TransactionId};

use crate::error::{BlobError, BlobResult};
use crate::gc::BinaryGarbageCollector;
use crate::retention::Retention;
use crate::traits::BlobStore;

/// Xpath of the main blob of a document, unprefixed.
pub const MAIN_BLOB_XPATH: &str = "content";

/// Storage key a record-mode provider uses for a document's blob.
///
/// The main blob is keyed by the document id alone; other blob properties
/// append their xpath with path separators flattened.
pub fn record_key(doc_id: &DocumentId, xpath: &str) -> String {
    if xpath == MAIN_BLOB_XPATH {
        doc_id.to_string()
    } else {
        format!("{doc_id}-{}", xpath.replace('/', "_"))
    }
}

/// Static description of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    /// Dedicated to immutable, retained content keyed by document identity.
    #[serde(default)]
    pub record: bool,
    /// Record-mode companion used when a document becomes a record.
    #[serde(default)]
    pub record_provider: Option<ProviderId>,
    /// Content is not durable; managed blobs from this provider are always
    /// copied when linked to a document.
    #[serde(default)]
    pub transient: bool,
}

impl ProviderDescriptor {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            record: false,
            record_provider: None,
            transient: false,
        }
    }

    pub fn record_mode(mut self) -> Self {
        self.record = true;
        self
    }

    pub fn with_record_provider(mut self, id: ProviderId) -> Self {
        self.record_provider = Some(id);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Everything a provider may use to decide where a write goes.
#[derive(Clone, Copy, Debug)]
pub struct BlobContext<'a> {
    pub data: &'a [u8],
    pub digest: &'a str,
    pub mime_type: Option<&'a str>,
    pub doc_id: Option<&'a DocumentId>,
    pub xpath: &'a str,
    /// Record-mode writes inside a transaction are staged until it commits.
    pub transaction: Option<&'a TransactionId>,
}

/// A named blob backend.
///
/// Implementations must be thread-safe. Keys exchanged with a provider are
/// backend keys, without the dispatch prefix.
pub trait BlobProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Physical storage identity, used to detect shared storage.
    fn storage_id(&self) -> &str;

    /// Store content and return its backend key.
    fn write(&self, context: &BlobContext<'_>) -> BlobResult<String>;

    /// Read the content under a backend key.
    fn read(&self, key: &str) -> BlobResult<Vec<u8>>;

    /// Read as seen from inside `transaction`: its staged writes first.
    fn read_in(&self, key: &str, _transaction: Option<&TransactionId>) -> BlobResult<Vec<u8>> {
        self.read(key)
    }

    fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Remove a backend key. Returns `true` if it existed.
    fn delete(&self, key: &str) -> BlobResult<bool>;

    /// Streaming access to the content under a backend key.
    fn open(&self, key: &str) -> BlobResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read(key)?)))
    }

    /// Apply a legal hold change. Only record-mode providers keep retention
    /// state; others ignore it.
    fn set_legal_hold(&self, _key: &str, _hold: bool) -> BlobResult<()> {
        Ok(())
    }

    /// Apply a retain-until change, with the same scope as legal holds.
    fn set_retain_until(&self, _key: &str, _until: Option<SystemTime>) -> BlobResult<()> {
        Ok(())
    }

    /// Move the writes staged by `transaction` into storage. Returns the
    /// number of keys written.
    fn commit_staged(&self, _transaction: &TransactionId) -> BlobResult<usize> {
        Ok(0)
    }

    /// Drop the writes staged by `transaction`.
    fn discard_staged(&self, _transaction: &TransactionId) {}

    fn garbage_collector(&self) -> Option<&BinaryGarbageCollector> {
        None
    }

    fn id(&self) -> &ProviderId {
        &self.descriptor().id
    }

    fn is_record_mode(&self) -> bool {
        self.descriptor().record
    }

    fn is_transient(&self) -> bool {
        self.descriptor().transient
    }

    fn record_provider(&self) -> Option<&ProviderId> {
        self.descriptor().record_provider.as_ref()
    }
}

/// Provider backed by a [`BlobStore`].
///
/// Regular providers key content by digest. Record-mode providers key it by
/// owning document, refuse to overwrite or delete retained keys, and keep
/// transactional writes in memory until the transaction commits.
pub struct StoreBlobProvider {
    descriptor: ProviderDescriptor,
    store: Arc<dyn BlobStore>,
    gc: Option<BinaryGarbageCollector>,
    retention: Arc<Retention>,
    staged: Mutex<HashMap<TransactionId, BTreeMap<String, Vec<u8>>>>,
}

impl StoreBlobProvider {
    /// Create a provider. Transient providers get no garbage collector.
    pub fn new(descriptor: ProviderDescriptor, store: Arc<dyn BlobStore>, gc_min_age: Duration) -> Self {
        let retention = Arc::new(Retention::new());
        let gc = if descriptor.transient {
            None
        } else {
            Some(BinaryGarbageCollector::new(store.clone(), gc_min_age).with_retention(retention.clone()))
        };
        Self {
            descriptor,
            store,
            gc,
            retention,
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Returns `true` if `key` is under legal hold.
    pub fn is_held(&self, key: &str) -> bool {
        self.retention.is_held(key)
    }

    /// Held, or retained until a future date.
    pub fn is_retained(&self, key: &str) -> bool {
        self.retention.is_retained(key)
    }

    /// Number of keys staged by `transaction` and not yet committed.
    pub fn staged_len(&self, transaction: &TransactionId) -> usize {
        self.staged
            .lock()
            .expect("lock poisoned")
            .get(transaction)
            .map_or(0, BTreeMap::len)
    }

    fn check_not_retained(&self, key: &str) -> BlobResult<()> {
        if self.is_retained(key) {
            return Err(BlobError::Retained {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

impl BlobProvider for StoreBlobProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn storage_id(&self) -> &str {
        self.store.storage_id()
    }

    fn write(&self, context: &BlobContext<'_>) -> BlobResult<String> {
        let key = if self.descriptor.record {
            let doc_id = context
                .doc_id
                .ok_or_else(|| BlobError::RecordWithoutDocument(self.descriptor.id.clone()))?;
            let key = record_key(doc_id, context.xpath);
            if let Some(tx) = context.transaction {
                // retention is checked when the transaction commits
                self.staged
                    .lock()
                    .expect("lock poisoned")
                    .entry(*tx)
                    .or_default()
                    .insert(key.clone(), context.data.to_vec());
                debug!(provider = %self.descriptor.id, %key, %tx, "record blob staged");
                return Ok(key);
            }
            self.check_not_retained(&key)?;
            key
        } else {
            context.digest.to_string()
        };
        self.store.put(&key, context.data)?;
        debug!(provider = %self.descriptor.id, %key, len = context.data.len(), "blob written");
        Ok(key)
    }

    fn read(&self, key: &str) -> BlobResult<Vec<u8>> {
        self.store
            .get(key)?
            .ok_or_else(|| BlobError::NotFound(format!("{}:{key}", self.descriptor.id)))
    }

    fn read_in(&self, key: &str, transaction: Option<&TransactionId>) -> BlobResult<Vec<u8>> {
        if let Some(tx) = transaction {
            let staged = self.staged.lock().expect("lock poisoned");
            if let Some(data) = staged.get(tx).and_then(|writes| writes.get(key)) {
                return Ok(data.clone());
            }
        }
        self.read(key)
    }

    fn exists(&self, key: &str) -> BlobResult<bool> {
        self.store.exists(key)
    }

    fn delete(&self, key: &str) -> BlobResult<bool> {
        self.check_not_retained(key)?;
        self.store.delete(key)
    }

    fn set_legal_hold(&self, key: &str, hold: bool) -> BlobResult<()> {
        if !self.descriptor.record {
            debug!(provider = %self.descriptor.id, key, "provider is not in record mode, hold ignored");
            return Ok(());
        }
        self.retention.set_legal_hold(key, hold);
        Ok(())
    }

    fn set_retain_until(&self, key: &str, until: Option<SystemTime>) -> BlobResult<()> {
        if !self.descriptor.record {
            debug!(provider = %self.descriptor.id, key, "provider is not in record mode, retention ignored");
            return Ok(());
        }
        self.retention.set_retain_until(key, until);
        Ok(())
    }

    fn commit_staged(&self, transaction: &TransactionId) -> BlobResult<usize> {
        let Some(writes) = self.staged.lock().expect("lock poisoned").remove(transaction) else {
            return Ok(0);
        };
        if let Some(key) = writes.keys().find(|key| self.is_retained(key)) {
            return Err(BlobError::Retained { key: key.clone() });
        }
        for (key, data) in &writes {
            self.store.put(key, data)?;
        }
        debug!(provider = %self.descriptor.id, tx = %transaction, count = writes.len(), "staged record blobs committed");
        Ok(writes.len())
    }

    fn discard_staged(&self, transaction: &TransactionId) {
        if let Some(writes) = self.staged.lock().expect("lock poisoned").remove(transaction) {
            debug!(provider = %self.descriptor.id, tx = %transaction, count = writes.len(), "staged record blobs discarded");
        }
    }

    fn garbage_collector(&self) -> Option<&BinaryGarbageCollector> {
        self.gc.as_ref()
    }
}

impl std::fmt::Debug for StoreBlobProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBlobProvider")
            .field("descriptor", &self.descriptor)
            .field("storage_id", &self.store.storage_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::content_digest;
    use crate::memory::InMemoryBlobStore;

    fn pid(s: &str) -> ProviderId {
        ProviderId::new(s).unwrap()
    }

    fn context<'a>(data: &'a [u8], digest: &'a str, doc: Option<&'a DocumentId>) -> BlobContext<'a> {
        BlobContext {
            data,
            digest,
            mime_type: Some("text/plain"),
            doc_id: doc,
            xpath: MAIN_BLOB_XPATH,
            transaction: None,
        }
    }

    fn provider(descriptor: ProviderDescriptor) -> StoreBlobProvider {
        StoreBlobProvider::new(
            descriptor,
            Arc::new(InMemoryBlobStore::new("p")),
            Duration::ZERO,
        )
    }

    #[test]
    fn regular_provider_keys_by_digest() {
        let p = provider(ProviderDescriptor::new(pid("test")));
        let digest = content_digest(b"foo");
        let key = p.write(&context(b"foo", &digest, None)).unwrap();
        assert_eq!(key, digest);
        assert_eq!(p.read(&key).unwrap(), b"foo");
    }

    #[test]
    fn record_provider_keys_by_document() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let digest = content_digest(b"foo");
        let key = p.write(&context(b"foo", &digest, Some(&doc))).unwrap();
        assert_eq!(key, doc.to_string());
    }

    #[test]
    fn record_provider_requires_document() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let digest = content_digest(b"foo");
        let err = p.write(&context(b"foo", &digest, None)).unwrap_err();
        assert!(matches!(err, BlobError::RecordWithoutDocument(_)));
    }

    #[test]
    fn record_key_flattens_secondary_xpaths() {
        let doc = DocumentId::new();
        assert_eq!(record_key(&doc, "files/0/file"), format!("{doc}-files_0_file"));
    }

    #[test]
    fn held_record_key_cannot_be_overwritten_or_deleted() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let digest = content_digest(b"v1");
        let key = p.write(&context(b"v1", &digest, Some(&doc))).unwrap();
        p.set_legal_hold(&key, true).unwrap();
        assert!(p.is_held(&key));

        let digest2 = content_digest(b"v2");
        assert!(matches!(
            p.write(&context(b"v2", &digest2, Some(&doc))),
            Err(BlobError::Retained { .. })
        ));
        assert!(matches!(p.delete(&key), Err(BlobError::Retained { .. })));
        assert_eq!(p.read(&key).unwrap(), b"v1");

        p.set_legal_hold(&key, false).unwrap();
        assert!(p.delete(&key).unwrap());
    }

    #[test]
    fn record_key_under_future_retention_is_protected() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let digest = content_digest(b"v1");
        let key = p.write(&context(b"v1", &digest, Some(&doc))).unwrap();

        p.set_retain_until(&key, Some(SystemTime::now() + Duration::from_secs(3600))).unwrap();
        assert!(p.is_retained(&key));
        assert!(!p.is_held(&key));
        assert!(matches!(p.delete(&key), Err(BlobError::Retained { .. })));

        p.set_retain_until(&key, Some(SystemTime::now() - Duration::from_secs(1))).unwrap();
        assert!(!p.is_retained(&key));
        assert!(p.delete(&key).unwrap());
    }

    #[test]
    fn transactional_record_writes_are_staged() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let digest = content_digest(b"v1");
        let key = p.write(&context(b"v1", &digest, Some(&doc))).unwrap();

        let tx = TransactionId::new();
        let digest2 = content_digest(b"v2");
        let staged = BlobContext {
            transaction: Some(&tx),
            ..context(b"v2", &digest2, Some(&doc))
        };
        assert_eq!(p.write(&staged).unwrap(), key);
        assert_eq!(p.staged_len(&tx), 1);
        assert_eq!(p.read(&key).unwrap(), b"v1");
        assert_eq!(p.read_in(&key, Some(&tx)).unwrap(), b"v2");
        assert_eq!(p.read_in(&key, Some(&TransactionId::new())).unwrap(), b"v1");

        assert_eq!(p.commit_staged(&tx).unwrap(), 1);
        assert_eq!(p.read(&key).unwrap(), b"v2");
        assert_eq!(p.staged_len(&tx), 0);
    }

    #[test]
    fn discarded_record_writes_never_reach_storage() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let tx = TransactionId::new();
        let digest = content_digest(b"draft");
        let staged = BlobContext {
            transaction: Some(&tx),
            ..context(b"draft", &digest, Some(&doc))
        };
        let key = p.write(&staged).unwrap();
        p.discard_staged(&tx);
        assert!(!p.exists(&key).unwrap());
        assert_eq!(p.commit_staged(&tx).unwrap(), 0);
    }

    #[test]
    fn staged_write_to_retained_key_fails_at_commit() {
        let p = provider(ProviderDescriptor::new(pid("records1")).record_mode());
        let doc = DocumentId::new();
        let digest = content_digest(b"v1");
        let key = p.write(&context(b"v1", &digest, Some(&doc))).unwrap();
        p.set_legal_hold(&key, true).unwrap();

        let tx = TransactionId::new();
        let digest2 = content_digest(b"v2");
        let staged = BlobContext {
            transaction: Some(&tx),
            ..context(b"v2", &digest2, Some(&doc))
        };
        p.write(&staged).unwrap();
        assert!(matches!(p.commit_staged(&tx), Err(BlobError::Retained { .. })));
        assert_eq!(p.read(&key).unwrap(), b"v1");
    }

    #[test]
    fn regular_provider_writes_through_transactions() {
        let p = provider(ProviderDescriptor::new(pid("test")));
        let tx = TransactionId::new();
        let digest = content_digest(b"foo");
        let staged = BlobContext {
            transaction: Some(&tx),
            ..context(b"foo", &digest, None)
        };
        let key = p.write(&staged).unwrap();
        assert_eq!(p.read(&key).unwrap(), b"foo");
        assert_eq!(p.staged_len(&tx), 0);
    }

    #[test]
    fn regular_provider_ignores_holds() {
        let p = provider(ProviderDescriptor::new(pid("test")));
        p.set_legal_hold("k", true).unwrap();
        assert!(!p.is_held("k"));
    }

    #[test]
    fn missing_key_is_not_found_with_provider_prefix() {
        let p = provider(ProviderDescriptor::new(pid("test")));
        let err = p.read("nope").unwrap_err();
        assert_eq!(err.to_string(), "blob not found: test:nope");
    }

    #[test]
    fn open_streams_content() {
        let p = provider(ProviderDescriptor::new(pid("test")));
        let digest = content_digest(b"stream me");
        let key = p.write(&context(b"stream me", &digest, None)).unwrap();
        let mut buf = String::new();
        p.open(&key).unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "stream me");
    }

    #[test]
    fn transient_provider_has_no_collector() {
        let p = provider(ProviderDescriptor::new(pid("tmp")).transient());
        assert!(p.is_transient());
        assert!(p.garbage_collector().is_none());
        let q = provider(ProviderDescriptor::new(pid("test")));
        assert!(q.garbage_collector().is_some());
    }
}
