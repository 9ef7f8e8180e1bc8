use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use tracing::{debug, error, warn};

use ecm_dispatch::DispatchError;
use ecm_types::{BlobKey, DocumentId};

use crate::document::{Document, VersionInfo};
use crate::error::{ConflictStatus, RepoError, RepoResult};
use crate::repository::Repository;
use crate::tx::Transaction;

/// Outcome of [`Session::make_record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MakeRecord {
    Done,
    AlreadyRecord,
}

#[derive(Clone, Debug)]
enum Staged {
    Put(Document),
    Removed,
}

/// Unit of work against a [`Repository`].
///
/// Document changes are staged and applied atomically by
/// [`commit`](Self::commit); dropping the session without committing rolls
/// them back.
///
/// Content-addressed blobs are written when the change is staged, and those
/// of rolled back changes are left for garbage collection. Record content is
/// keyed by document, so record-mode providers hold it per transaction until
/// commit; [`read_blob`](Self::read_blob) sees it, other sessions do not.
/// Legal hold and retain-until changes reach the providers at commit too.
pub struct Session<'r> {
    repo: &'r Repository,
    tx: Transaction,
    staged: BTreeMap<DocumentId, Staged>,
    new_versions: Vec<Document>,
    /// Pending legal hold state per blob key.
    holds: BTreeMap<BlobKey, bool>,
    /// Pending retain-until dates per blob key.
    retention: BTreeMap<BlobKey, Option<SystemTime>>,
}

impl<'r> Session<'r> {
    pub(crate) fn new(repo: &'r Repository, tx: Transaction) -> Self {
        Self {
            repo,
            tx,
            staged: BTreeMap::new(),
            new_versions: Vec::new(),
            holds: BTreeMap::new(),
            retention: BTreeMap::new(),
        }
    }

    pub fn repository(&self) -> &'r Repository {
        self.repo
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn has_changes(&self) -> bool {
        !self.staged.is_empty() || !self.new_versions.is_empty()
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    fn lookup(&self, id: &DocumentId) -> Option<Document> {
        match self.staged.get(id) {
            Some(Staged::Put(doc)) => Some(doc.clone()),
            Some(Staged::Removed) => None,
            None => self.repo.read_state().docs.get(id).cloned(),
        }
    }

    fn lookup_version(&self, id: &DocumentId) -> Option<Document> {
        self.new_versions
            .iter()
            .find(|v| &v.id == id)
            .cloned()
            .or_else(|| self.repo.read_state().versions.get(id).cloned())
    }

    pub fn exists(&self, id: &DocumentId) -> RepoResult<bool> {
        self.tx.check()?;
        Ok(self.lookup(id).is_some() || self.lookup_version(id).is_some())
    }

    /// Live document or version by id.
    pub fn get(&self, id: &DocumentId) -> RepoResult<Document> {
        self.tx.check()?;
        self.lookup(id)
            .or_else(|| self.lookup_version(id))
            .ok_or_else(|| RepoError::DocumentNotFound(id.to_string()))
    }

    pub fn find_child(&self, parent: DocumentId, name: &str) -> RepoResult<Option<Document>> {
        self.tx.check()?;
        let staged = self.staged.values().find_map(|s| match s {
            Staged::Put(doc) if doc.parent == Some(parent) && doc.name == name => Some(doc.clone()),
            _ => None,
        });
        if staged.is_some() {
            return Ok(staged);
        }
        let state = self.repo.read_state();
        Ok(state
            .docs
            .values()
            .find(|doc| {
                doc.parent == Some(parent) && doc.name == name && !self.staged.contains_key(&doc.id)
            })
            .cloned())
    }

    pub fn get_child(&self, parent: DocumentId, name: &str) -> RepoResult<Document> {
        self.find_child(parent, name)?
            .ok_or_else(|| RepoError::DocumentNotFound(format!("{parent}/{name}")))
    }

    pub fn children(&self, parent: DocumentId) -> RepoResult<Vec<Document>> {
        self.tx.check()?;
        let mut children: Vec<Document> = self
            .staged
            .values()
            .filter_map(|s| match s {
                Staged::Put(doc) if doc.parent == Some(parent) => Some(doc.clone()),
                _ => None,
            })
            .collect();
        let state = self.repo.read_state();
        children.extend(
            state
                .docs
                .values()
                .filter(|doc| doc.parent == Some(parent) && !self.staged.contains_key(&doc.id))
                .cloned(),
        );
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    pub fn is_record(&self, id: &DocumentId) -> RepoResult<bool> {
        Ok(self.get(id)?.is_record)
    }

    /// Content under `key`, including record content staged by this session.
    pub fn read_blob(&self, key: &BlobKey) -> RepoResult<Vec<u8>> {
        self.tx.check()?;
        let tx = self.tx.id();
        Ok(self.repo.blob_manager().read_blob_in(key, self.repo.name(), Some(&tx))?)
    }

    /// Main blob content of a document, if it has one.
    pub fn content(&self, id: &DocumentId) -> RepoResult<Option<Vec<u8>>> {
        let doc = self.get(id)?;
        match doc.content().and_then(|b| b.key()) {
            Some(key) => self.read_blob(key).map(Some),
            None => Ok(None),
        }
    }

    /// Versions of a live document, oldest first.
    pub fn versions(&self, id: &DocumentId) -> RepoResult<Vec<Document>> {
        self.tx.check()?;
        let belongs = |v: &&Document| v.version.as_ref().is_some_and(|info| &info.live == id);
        let mut versions: Vec<Document> = self.new_versions.iter().filter(belongs).cloned().collect();
        versions.extend(self.repo.read_state().versions.values().filter(belongs).cloned());
        versions.sort_by_key(|v| v.version.as_ref().map(|info| info.number));
        Ok(versions)
    }

    // -----------------------------------------------------------------------
    // Blob handling
    // -----------------------------------------------------------------------

    /// Pass every blob of `doc` through the blob manager; xpaths present on
    /// `previous` but gone from `doc` are cleared.
    fn write_blobs(&self, doc: &mut Document, previous: Option<&Document>) -> RepoResult<()> {
        let manager = self.repo.blob_manager();
        let repository = self.repo.name();
        let tx = self.tx.id();
        if let Some(previous) = previous {
            for xpath in previous.blobs.keys().filter(|x| !doc.blobs.contains_key(*x)) {
                manager.write_blob_in(None, &previous.context(repository), xpath, Some(&tx))?;
            }
        }
        let xpaths: Vec<String> = doc.blobs.keys().cloned().collect();
        for xpath in xpaths {
            let blob = doc.blobs[&xpath].clone();
            let written = manager.write_blob_in(Some(&blob), &doc.context(repository), &xpath, Some(&tx))?;
            doc.set_blob(xpath, written);
        }
        Ok(())
    }

    fn blob_keys(doc: &Document) -> Vec<BlobKey> {
        doc.blobs.values().filter_map(|b| b.key().cloned()).collect()
    }

    fn require_record(&self, id: &DocumentId) -> RepoResult<Document> {
        let doc = self.require(id)?;
        if !doc.is_record {
            return Err(RepoError::conflict(
                ConflictStatus::Conflict,
                format!("Document {id} is not a record"),
            ));
        }
        Ok(doc)
    }

    fn require(&self, id: &DocumentId) -> RepoResult<Document> {
        self.lookup(id)
            .ok_or_else(|| RepoError::DocumentNotFound(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn create(&mut self, mut doc: Document) -> RepoResult<Document> {
        self.tx.check()?;
        let parent = doc
            .parent
            .ok_or_else(|| RepoError::InvalidOperation("documents need a parent".into()))?;
        if self.lookup(&parent).is_none() {
            return Err(RepoError::DocumentNotFound(parent.to_string()));
        }
        if self.lookup(&doc.id).is_some() {
            return Err(RepoError::conflict(
                ConflictStatus::Conflict,
                format!("Document {} already exists", doc.id),
            ));
        }
        doc.clear_record_state();
        doc.version = None;
        self.write_blobs(&mut doc, None)?;
        debug!(id = %doc.id, name = %doc.name, doc_type = %doc.doc_type, "document created");
        self.staged.insert(doc.id, Staged::Put(doc.clone()));
        Ok(doc)
    }

    /// Persist changes to properties and blobs; every blob is re-dispatched.
    pub fn save(&mut self, mut doc: Document) -> RepoResult<Document> {
        self.tx.check()?;
        if doc.is_version() {
            return Err(RepoError::conflict(
                ConflictStatus::Conflict,
                format!("Cannot modify version {}", doc.id),
            ));
        }
        let previous = self.require(&doc.id)?;
        doc.is_record = previous.is_record;
        doc.legal_hold = previous.legal_hold;
        doc.retain_until = previous.retain_until;
        doc.version = None;
        self.write_blobs(&mut doc, Some(&previous))?;
        debug!(id = %doc.id, "document saved");
        self.staged.insert(doc.id, Staged::Put(doc.clone()));
        Ok(doc)
    }

    /// Remove a document and its descendants.
    pub fn remove(&mut self, id: &DocumentId) -> RepoResult<()> {
        self.tx.check()?;
        if *id == self.repo.root_id() {
            return Err(RepoError::InvalidOperation("cannot remove the root document".into()));
        }
        let doc = self.require(id)?;
        let mut pending = vec![doc];
        let mut removed = Vec::new();
        while let Some(doc) = pending.pop() {
            let mut cleared = doc.clone();
            cleared.blobs.clear();
            self.write_blobs(&mut cleared, Some(&doc))?;
            pending.extend(self.children(doc.id)?);
            removed.push(doc.id);
        }
        for id in &removed {
            self.staged.insert(*id, Staged::Removed);
        }
        debug!(%id, count = removed.len(), "documents removed");
        Ok(())
    }

    /// Discard staged changes to `id` and return the committed document.
    pub fn refresh(&mut self, id: &DocumentId) -> RepoResult<Document> {
        self.tx.check()?;
        self.staged.remove(id);
        self.repo
            .read_state()
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::DocumentNotFound(id.to_string()))
    }

    /// Turn a document into a record; its blobs move to record-mode storage
    /// keyed by the document id.
    pub fn make_record(&mut self, id: &DocumentId) -> RepoResult<MakeRecord> {
        self.tx.check()?;
        let previous = self.require(id)?;
        if previous.is_record {
            return Ok(MakeRecord::AlreadyRecord);
        }
        let mut doc = previous.clone();
        doc.is_record = true;
        self.write_blobs(&mut doc, Some(&previous))?;
        debug!(%id, "document is now a record");
        self.staged.insert(doc.id, Staged::Put(doc));
        Ok(MakeRecord::Done)
    }

    /// Place or lift a legal hold on a record.
    pub fn set_legal_hold(&mut self, id: &DocumentId, hold: bool) -> RepoResult<Document> {
        self.tx.check()?;
        let mut doc = self.require_record(id)?;
        doc.legal_hold = hold;
        for key in Self::blob_keys(&doc) {
            self.holds.insert(key, hold);
        }
        debug!(%id, hold, "legal hold staged");
        self.staged.insert(doc.id, Staged::Put(doc.clone()));
        Ok(doc)
    }

    /// Set or clear the retain-until date of a record.
    ///
    /// A retention date still in the future can only be extended.
    pub fn set_retain_until(&mut self, id: &DocumentId, until: Option<SystemTime>) -> RepoResult<Document> {
        self.tx.check()?;
        let mut doc = self.require_record(id)?;
        if let Some(current) = doc.retain_until.filter(|date| *date > SystemTime::now()) {
            if until.map_or(true, |date| date < current) {
                return Err(RepoError::conflict(
                    ConflictStatus::Conflict,
                    format!("Cannot reduce retention time of document {id}"),
                ));
            }
        }
        doc.retain_until = until;
        for key in Self::blob_keys(&doc) {
            self.retention.insert(key, until);
        }
        debug!(%id, ?until, "retain-until staged");
        self.staged.insert(doc.id, Staged::Put(doc.clone()));
        Ok(doc)
    }

    /// Copy a document under `parent`; the copy is never a record.
    pub fn copy(&mut self, id: &DocumentId, parent: DocumentId, name: Option<&str>) -> RepoResult<Document> {
        self.tx.check()?;
        let source = self.get(id)?;
        if self.lookup(&parent).is_none() {
            return Err(RepoError::DocumentNotFound(parent.to_string()));
        }
        let mut copy = source.clone();
        copy.id = DocumentId::new();
        copy.parent = Some(parent);
        copy.name = name.map(str::to_string).unwrap_or(source.name);
        copy.clear_record_state();
        copy.version = None;
        self.write_blobs(&mut copy, None)?;
        debug!(source = %id, copy = %copy.id, "document copied");
        self.staged.insert(copy.id, Staged::Put(copy.clone()));
        Ok(copy)
    }

    /// Snapshot a live document as its next version.
    pub fn check_in(&mut self, id: &DocumentId) -> RepoResult<Document> {
        self.tx.check()?;
        let live = self.get(id)?;
        if live.is_version() {
            return Err(RepoError::conflict(
                ConflictStatus::Conflict,
                format!("Cannot check in version {id}"),
            ));
        }
        let number = self
            .versions(id)?
            .last()
            .and_then(|v| v.version.as_ref().map(|info| info.number))
            .unwrap_or(0)
            + 1;
        let mut version = live.clone();
        version.id = DocumentId::new();
        version.clear_record_state();
        version.version = Some(VersionInfo { live: live.id, number });
        self.write_blobs(&mut version, None)?;
        debug!(%id, version = %version.id, number, "document checked in");
        self.new_versions.push(version.clone());
        Ok(version)
    }

    /// Replace the content of a live document with one of its versions.
    pub fn restore_to_version(&mut self, id: &DocumentId, version_id: &DocumentId) -> RepoResult<Document> {
        self.tx.check()?;
        let live = self.require(id)?;
        if live.is_retained() {
            return Err(DispatchError::SecurityViolation(format!(
                "Cannot restore document {id}, it is under retention / hold"
            ))
            .into());
        }
        let version = self
            .lookup_version(version_id)
            .filter(|v| v.version.as_ref().is_some_and(|info| &info.live == id))
            .ok_or_else(|| {
                RepoError::conflict(
                    ConflictStatus::NotFound,
                    format!("Version {version_id} not found for document {id}"),
                )
            })?;
        let mut restored = live.clone();
        restored.properties = version.properties;
        restored.blobs = version.blobs;
        restored.clear_record_state();
        self.write_blobs(&mut restored, Some(&live))?;
        debug!(%id, version = %version_id, "document restored");
        self.staged.insert(restored.id, Staged::Put(restored.clone()));
        Ok(restored)
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Apply staged changes atomically.
    ///
    /// Fails with `ConcurrentUpdate` when a sibling with the same name was
    /// committed concurrently, and with `TransactionTimeout` past the
    /// transaction deadline; nothing is applied in either case.
    ///
    /// Blob side effects are published before the documents change: hold
    /// releases, then staged record content, then hold grants and
    /// retain-until dates. If publishing fails the documents are left as they
    /// were and the released holds are granted again.
    pub fn commit(mut self) -> RepoResult<()> {
        self.tx.prepare()?;
        let repo = self.repo;
        let mut state = repo.write_state();

        let mut names: HashMap<(DocumentId, &str), DocumentId> = HashMap::new();
        for doc in state.docs.values() {
            if let (Some(parent), false) = (doc.parent, self.staged.contains_key(&doc.id)) {
                names.insert((parent, doc.name.as_str()), doc.id);
            }
        }
        for staged in self.staged.values() {
            let Staged::Put(doc) = staged else { continue };
            let Some(parent) = doc.parent else { continue };
            if let Some(other) = names.insert((parent, doc.name.as_str()), doc.id) {
                if other != doc.id {
                    warn!(%parent, name = %doc.name, "unique name violation at commit");
                    self.tx.rollback();
                    return Err(RepoError::ConcurrentUpdate(format!(
                        "document {} already exists under {parent}",
                        doc.name
                    )));
                }
            }
        }
        drop(names);

        if let Err(e) = self.publish_blobs() {
            error!(tx = %self.tx.id(), error = %e, "blob changes not published, commit abandoned");
            self.tx.rollback();
            return Err(e);
        }
        self.tx.commit()?;

        for (id, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Staged::Put(doc) => {
                    state.docs.insert(id, doc);
                }
                Staged::Removed => {
                    state.docs.remove(&id);
                }
            }
        }
        for version in self.new_versions.drain(..) {
            state.versions.insert(version.id, version);
        }
        Ok(())
    }

    fn publish_blobs(&mut self) -> RepoResult<()> {
        let repo = self.repo;
        let manager = repo.blob_manager();
        let repository = repo.name();
        let tx = self.tx.id();

        let holds = std::mem::take(&mut self.holds);
        let mut released = Vec::new();
        for key in holds.iter().filter(|(_, hold)| !**hold).map(|(key, _)| key) {
            if let Err(e) = manager.notify_legal_hold(key, repository, false) {
                self.regrant(&released);
                return Err(e.into());
            }
            released.push(key);
        }
        if let Err(e) = manager.commit_staged(&tx) {
            self.regrant(&released);
            return Err(e.into());
        }
        for key in holds.iter().filter(|(_, hold)| **hold).map(|(key, _)| key) {
            manager.notify_legal_hold(key, repository, true)?;
        }
        for (key, until) in std::mem::take(&mut self.retention) {
            manager.notify_retain_until(&key, repository, until)?;
        }
        Ok(())
    }

    fn regrant(&self, released: &[&BlobKey]) {
        let manager = self.repo.blob_manager();
        for key in released {
            if let Err(e) = manager.notify_legal_hold(key, self.repo.name(), true) {
                error!(%key, error = %e, "legal hold could not be restored");
            }
        }
    }

    /// Discard staged changes.
    pub fn rollback(mut self) {
        self.tx.rollback();
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.tx.is_active() && self.has_changes() {
            debug!(tx = %self.tx.id(), "session dropped without commit");
        }
        self.tx.rollback();
        self.repo.blob_manager().discard_staged(&self.tx.id());
    }
}
