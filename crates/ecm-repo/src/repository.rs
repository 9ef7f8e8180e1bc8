use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ecm_dispatch::{BlobReferences, DocumentBlobManager};
use ecm_lock::KeyedLockCoordinator;
use ecm_types::{BlobKey, DocumentId};

use crate::document::Document;
use crate::error::RepoResult;
use crate::session::Session;
use crate::tx::{TransactionManager, DEFAULT_TRANSACTION_TIMEOUT};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub name: String,
    pub transaction_timeout_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            transaction_timeout_secs: DEFAULT_TRANSACTION_TIMEOUT.as_secs(),
        }
    }
}

impl RepositoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_secs = timeout.as_secs();
        self
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// Outcome of [`Repository::get_or_create_document`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetOrCreate {
    Created(Document),
    Found(Document),
}

impl GetOrCreate {
    pub fn document(&self) -> &Document {
        match self {
            Self::Created(doc) | Self::Found(doc) => doc,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Self::Created(doc) | Self::Found(doc) => doc,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Committed documents and versions.
#[derive(Default)]
pub(crate) struct RepoState {
    pub(crate) docs: HashMap<DocumentId, Document>,
    pub(crate) versions: BTreeMap<DocumentId, Document>,
}

/// In-memory document repository.
///
/// Documents live in a tree rooted at [`root_id`](Self::root_id); all reads
/// and writes go through a [`Session`], whose changes become visible to
/// other sessions at commit.
pub struct Repository {
    name: String,
    blobs: Arc<DocumentBlobManager>,
    transactions: TransactionManager,
    root: DocumentId,
    state: RwLock<RepoState>,
}

impl Repository {
    pub fn new(name: impl Into<String>, blobs: Arc<DocumentBlobManager>) -> Self {
        Self::with_config(RepositoryConfig::new(name), blobs)
    }

    pub fn with_config(config: RepositoryConfig, blobs: Arc<DocumentBlobManager>) -> Self {
        let root = Document::root();
        let root_id = root.id;
        let mut state = RepoState::default();
        state.docs.insert(root_id, root);
        info!(repository = %config.name, root = %root_id, "repository opened");
        Self {
            transactions: TransactionManager::new(config.transaction_timeout()),
            name: config.name,
            blobs,
            root: root_id,
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_id(&self) -> DocumentId {
        self.root
    }

    pub fn blob_manager(&self) -> &Arc<DocumentBlobManager> {
        &self.blobs
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Session bound to a new transaction with the default timeout.
    pub fn open_session(&self) -> Session<'_> {
        Session::new(self, self.transactions.begin())
    }

    pub fn open_session_with_timeout(&self, timeout: Duration) -> Session<'_> {
        Session::new(self, self.transactions.begin_with_timeout(timeout))
    }

    /// Committed documents, root included.
    pub fn document_count(&self) -> usize {
        self.read_state().docs.len()
    }

    pub fn version_count(&self) -> usize {
        self.read_state().versions.len()
    }

    /// Find the child `name` of `parent`, creating it if missing.
    ///
    /// Runs under the lock key `<repository>-<parentId>-<name>` and commits
    /// inside the lock, so concurrent callers observe exactly one creation.
    pub fn get_or_create_document(
        &self,
        locks: &KeyedLockCoordinator,
        parent: DocumentId,
        name: &str,
        doc_type: &str,
    ) -> RepoResult<GetOrCreate> {
        let key = format!("{}-{parent}-{name}", self.name);
        locks.do_atomically(&key, || -> RepoResult<GetOrCreate> {
            let mut session = self.open_session();
            if let Some(existing) = session.find_child(parent, name)? {
                return Ok(GetOrCreate::Found(existing));
            }
            let created = session.create(Document::new(parent, name, doc_type))?;
            session.commit()?;
            debug!(repository = %self.name, %parent, name, id = %created.id, "document created");
            Ok(GetOrCreate::Created(created))
        })
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, RepoState> {
        self.state.read().expect("lock poisoned")
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, RepoState> {
        self.state.write().expect("lock poisoned")
    }
}

impl BlobReferences for Repository {
    fn repository_name(&self) -> &str {
        &self.name
    }

    fn mark_referenced_blobs(&self, marker: &mut dyn FnMut(&BlobKey)) {
        let state = self.read_state();
        let documents = state.docs.values().chain(state.versions.values());
        for doc in documents {
            for key in doc.blobs.values().filter_map(|b| b.key()) {
                marker(key);
            }
        }
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("documents", &self.document_count())
            .finish()
    }
}
