use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, error, info, warn};

use ecm_blob::{
    content_digest, BinaryGarbageCollector, BinaryManagerStatus, Blob, BlobContext, BlobError,
    BlobProvider, BlobSource, ManagedRef, ProviderRegistry,
};
use ecm_types::{BlobKey, ProviderId, TransactionId};

use crate::dispatcher::{BlobDispatch, BlobDispatcher, DocumentContext};
use crate::error::{DispatchError, DispatchResult};

/// Source of live blob keys for garbage collection.
///
/// A repository reports every key held by its documents and versions.
pub trait BlobReferences {
    fn repository_name(&self) -> &str;

    fn mark_referenced_blobs(&self, marker: &mut dyn FnMut(&BlobKey));
}

/// Resets the manager-level GC flag when a collection ends, however it ends.
struct GcRunning<'a>(&'a AtomicBool);

impl Drop for GcRunning<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Writes, reads and collects the blobs of documents.
///
/// Owns the provider registry and the dispatcher. Every blob written to a
/// document property goes through [`write_blob`](Self::write_blob), which
/// re-evaluates the dispatch rules, redirects records to record-mode
/// providers and enforces retention.
pub struct DocumentBlobManager {
    registry: ProviderRegistry,
    dispatcher: Box<dyn BlobDispatcher>,
    /// Dispatcher providers plus their record companions.
    managed: Vec<ProviderId>,
    gc_running: AtomicBool,
}

impl DocumentBlobManager {
    /// Every provider the dispatcher names, and every record companion, must
    /// be registered.
    pub fn new(registry: ProviderRegistry, dispatcher: Box<dyn BlobDispatcher>) -> DispatchResult<Self> {
        let mut managed: Vec<ProviderId> = Vec::new();
        for id in dispatcher.provider_ids() {
            if !registry.contains(id) {
                return Err(DispatchError::config(format!(
                    "dispatcher {} routes to unknown blob provider {id}",
                    dispatcher.name()
                )));
            }
            if !managed.contains(id) {
                managed.push(id.clone());
            }
        }
        let companions: Vec<ProviderId> = managed
            .iter()
            .filter_map(|id| registry.record_companion(id))
            .collect();
        for companion in companions {
            if !registry.contains(&companion) {
                return Err(DispatchError::config(format!(
                    "unknown record blob provider {companion}"
                )));
            }
            if !managed.contains(&companion) {
                managed.push(companion);
            }
        }
        debug!(dispatcher = dispatcher.name(), providers = ?managed, "document blob manager ready");
        Ok(Self {
            registry,
            dispatcher,
            managed,
            gc_running: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &dyn BlobDispatcher {
        self.dispatcher.as_ref()
    }

    /// Providers this manager dispatches to, including record companions.
    pub fn managed_provider_ids(&self) -> &[ProviderId] {
        &self.managed
    }

    fn is_managed(&self, id: &ProviderId) -> bool {
        self.managed.contains(id)
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Where a blob written to `xpath` of the document would be stored.
    ///
    /// Records go to the record companion of the regular target.
    pub fn route(&self, blob: &Blob, doc: &DocumentContext<'_>, xpath: &str) -> DispatchResult<BlobDispatch> {
        let dispatch = self.dispatcher.dispatch(blob, doc, xpath);
        if !doc.is_record {
            return Ok(dispatch);
        }
        let companion = self.registry.record_companion(&dispatch.provider_id).ok_or_else(|| {
            DispatchError::config(format!(
                "blob provider {} has no record provider for record document {}",
                dispatch.provider_id, doc.doc_id
            ))
        })?;
        Ok(BlobDispatch::for_blob(companion, dispatch.add_prefix, blob))
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Store `blob` for `xpath` of the document and return the managed value
    /// to persist on the document; `None` clears the property.
    pub fn write_blob(
        &self,
        blob: Option<&Blob>,
        doc: &DocumentContext<'_>,
        xpath: &str,
    ) -> DispatchResult<Option<Blob>> {
        self.write_blob_in(blob, doc, xpath, None)
    }

    /// [`write_blob`](Self::write_blob) on behalf of `transaction`.
    ///
    /// Record-mode providers stage the content until
    /// [`commit_staged`](Self::commit_staged); content read to copy a managed
    /// blob sees the transaction's own staged writes.
    pub fn write_blob_in(
        &self,
        blob: Option<&Blob>,
        doc: &DocumentContext<'_>,
        xpath: &str,
        transaction: Option<&TransactionId>,
    ) -> DispatchResult<Option<Blob>> {
        let Some(blob) = blob else {
            if doc.retained {
                return Err(DispatchError::SecurityViolation(format!(
                    "Cannot delete blob from document {}, it is under retention / hold",
                    doc.doc_id
                )));
            }
            return Ok(None);
        };

        let mut reusable = None;
        if let Some(current) = blob.managed_ref() {
            let provider = self.registry.require(&current.provider_id)?;
            if !provider.is_transient() {
                if !self.is_managed(&current.provider_id) {
                    debug!(key = %current.key, "blob not managed by dispatcher, key kept");
                    return Ok(Some(blob.clone()));
                }
                reusable = Some(current);
            }
        }

        let dispatch = self.route(blob, doc, xpath)?;
        if let Some(current) = reusable {
            if current.provider_id == dispatch.provider_id {
                debug!(key = %current.key, "blob already at target provider, key kept");
                return Ok(Some(blob.clone()));
            }
        }

        if doc.retained {
            return Err(DispatchError::SecurityViolation(format!(
                "Cannot change blob from document {}, it is under retention / hold",
                doc.doc_id
            )));
        }

        let target = self.registry.require(&dispatch.provider_id)?;
        let data = self.load_content(blob, transaction)?;
        let digest = match blob.managed_ref() {
            Some(current) if !current.digest.is_empty() => current.digest.clone(),
            _ => content_digest(&data),
        };
        let backend_key = target.write(&BlobContext {
            data: &data,
            digest: &digest,
            mime_type: blob.mime_type.as_deref(),
            doc_id: Some(doc.doc_id),
            xpath,
            transaction,
        })?;
        let key = if dispatch.add_prefix {
            BlobKey::prefixed(dispatch.provider_id.clone(), backend_key)
        } else {
            BlobKey::unprefixed(backend_key)
        };
        debug!(doc = %doc.doc_id, xpath, %key, copied = dispatch.copy_before_link, "blob written");
        Ok(Some(blob.with_source(BlobSource::Managed(ManagedRef {
            provider_id: dispatch.provider_id,
            key,
            length: data.len() as u64,
            digest,
        }))))
    }

    fn load_content<'b>(&self, blob: &'b Blob, transaction: Option<&TransactionId>) -> DispatchResult<Cow<'b, [u8]>> {
        match &blob.source {
            BlobSource::Bytes(data) => Ok(Cow::Borrowed(data.as_slice())),
            BlobSource::Managed(current) => {
                let provider = self.registry.require(&current.provider_id)?;
                Ok(Cow::Owned(provider.read_in(current.key.backend_key(), transaction)?))
            }
        }
    }

    /// Flush the record writes staged by `transaction` into storage.
    ///
    /// On failure the remaining staged writes of the transaction are dropped.
    pub fn commit_staged(&self, transaction: &TransactionId) -> DispatchResult<usize> {
        let mut written = 0;
        for (i, id) in self.managed.iter().enumerate() {
            let Some(provider) = self.registry.get(id) else {
                continue;
            };
            match provider.commit_staged(transaction) {
                Ok(n) => written += n,
                Err(e) => {
                    error!(provider = %id, tx = %transaction, error = %e, "staged blobs not committed");
                    for rest in &self.managed[i + 1..] {
                        if let Some(p) = self.registry.get(rest) {
                            p.discard_staged(transaction);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        if written > 0 {
            debug!(tx = %transaction, written, "staged blobs committed");
        }
        Ok(written)
    }

    /// Drop the record writes staged by `transaction`.
    pub fn discard_staged(&self, transaction: &TransactionId) {
        for provider in self.managed.iter().filter_map(|id| self.registry.get(id)) {
            provider.discard_staged(transaction);
        }
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Provider owning `key`; unprefixed keys resolve through the
    /// dispatcher's default provider for `repository`.
    pub fn provider_for_key(&self, key: &BlobKey, repository: &str) -> DispatchResult<&Arc<dyn BlobProvider>> {
        let id = match key.provider() {
            Some(id) => id,
            None => self.dispatcher.default_provider(repository),
        };
        Ok(self.registry.require(id)?)
    }

    pub fn read_blob(&self, key: &BlobKey, repository: &str) -> DispatchResult<Vec<u8>> {
        self.read_blob_in(key, repository, None)
    }

    /// Read as seen from inside `transaction`, staged record writes included.
    pub fn read_blob_in(
        &self,
        key: &BlobKey,
        repository: &str,
        transaction: Option<&TransactionId>,
    ) -> DispatchResult<Vec<u8>> {
        let provider = self.provider_for_key(key, repository)?;
        Ok(provider.read_in(key.backend_key(), transaction)?)
    }

    /// Managed value for a stored key, as a document would hold it.
    pub fn resolve_blob(&self, key: &BlobKey, repository: &str) -> DispatchResult<Blob> {
        let provider = self.provider_for_key(key, repository)?;
        let data = provider.read(key.backend_key())?;
        Ok(Blob::managed(ManagedRef {
            provider_id: provider.id().clone(),
            key: key.clone(),
            length: data.len() as u64,
            digest: content_digest(&data),
        }))
    }

    /// Propagate a legal hold change to the provider storing `key`.
    pub fn notify_legal_hold(&self, key: &BlobKey, repository: &str, hold: bool) -> DispatchResult<()> {
        let provider = self.provider_for_key(key, repository)?;
        provider.set_legal_hold(key.backend_key(), hold)?;
        debug!(%key, hold, "legal hold propagated");
        Ok(())
    }

    /// Propagate a retain-until change to the provider storing `key`.
    pub fn notify_retain_until(
        &self,
        key: &BlobKey,
        repository: &str,
        until: Option<SystemTime>,
    ) -> DispatchResult<()> {
        let provider = self.provider_for_key(key, repository)?;
        provider.set_retain_until(key.backend_key(), until)?;
        debug!(%key, ?until, "retain-until propagated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    fn collectors(&self) -> Vec<&BinaryGarbageCollector> {
        self.managed
            .iter()
            .filter_map(|id| self.registry.get(id))
            .filter_map(|p| p.garbage_collector())
            .collect()
    }

    /// Whether two managed providers sweep the same physical storage.
    pub fn has_shared_storage(&self) -> bool {
        let shared = self.registry.shared_storages(self.managed.iter());
        if shared.is_empty() {
            return false;
        }
        warn!(storages = ?shared, "shared storages detected");
        true
    }

    pub fn is_gc_in_progress(&self) -> bool {
        self.gc_running.load(Ordering::SeqCst) || self.collectors().iter().any(|gc| gc.is_in_progress())
    }

    /// Mark every key reported by `references` and sweep the stores of the
    /// managed providers, deleting unreferenced binaries when `delete`.
    pub fn garbage_collect_binaries(
        &self,
        references: &[&dyn BlobReferences],
        delete: bool,
    ) -> DispatchResult<BinaryManagerStatus> {
        if self
            .gc_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BlobError::GcInProgress("document blob manager".into()).into());
        }
        let _running = GcRunning(&self.gc_running);

        warn!(delete, "binary gc starting");
        let clock = Instant::now();
        let gcs = self.collectors();
        let shared = self.has_shared_storage();

        for (started, gc) in gcs.iter().enumerate() {
            if let Err(e) = gc.start() {
                for gc in &gcs[..started] {
                    let _ = gc.stop(false);
                }
                return Err(e.into());
            }
        }

        for reference in references {
            let repository = reference.repository_name();
            info!(repository, "marking binaries");
            reference.mark_referenced_blobs(&mut |key: &BlobKey| {
                if shared {
                    for gc in &gcs {
                        gc.mark(key.backend_key());
                    }
                    return;
                }
                match self
                    .provider_for_key(key, repository)
                    .ok()
                    .and_then(|p| p.garbage_collector())
                {
                    Some(gc) => gc.mark(key.backend_key()),
                    None => error!(%key, "unknown binary manager for key"),
                }
            });
        }

        let mut total = BinaryManagerStatus::default();
        let mut first_error = None;
        for gc in &gcs {
            info!(storage = gc.id(), "sweeping binaries");
            match gc.stop(delete) {
                Ok(status) => total += &status,
                Err(e) => {
                    error!(storage = gc.id(), error = %e, "binary gc sweep failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }
        total.gc_duration = clock.elapsed();
        warn!(status = %total, "binary gc completed");
        Ok(total)
    }

    /// Delete one stored blob of `repository` if no document references it.
    ///
    /// Returns whether the blob was (or, on a dry run, would be) deleted.
    pub fn delete_blob(
        &self,
        repository: &str,
        key: &BlobKey,
        references: &[&dyn BlobReferences],
        dry_run: bool,
    ) -> DispatchResult<bool> {
        if repository.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "Repository name cannot be null or empty".into(),
            ));
        }
        if self.has_shared_storage() {
            return Err(DispatchError::SharedStorage);
        }
        let provider = self.provider_for_key(key, repository)?;

        let mut live = BTreeSet::new();
        for reference in references.iter().filter(|r| r.repository_name() == repository) {
            reference.mark_referenced_blobs(&mut |k: &BlobKey| {
                live.insert(k.to_string());
            });
        }
        if live.contains(&key.to_string()) {
            info!(%key, repository, provider = %provider.id(), "blob is referenced and cannot be deleted");
            return Ok(false);
        }
        if dry_run {
            info!(%key, repository, provider = %provider.id(), "blob can be deleted");
        } else {
            provider.delete(key.backend_key())?;
            debug!(%key, provider = %provider.id(), "blob deleted");
        }
        Ok(true)
    }
}

impl std::fmt::Debug for DocumentBlobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBlobManager")
            .field("dispatcher", &self.dispatcher.name())
            .field("managed", &self.managed)
            .field("registry", &self.registry)
            .finish()
    }
}
