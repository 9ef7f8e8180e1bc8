#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ecm_blob::{Blob, InMemoryBlobStore, ProviderDescriptor, ProviderRegistry, StoreBlobProvider};
use ecm_dispatch::{DocumentBlobManager, MimePrefixDispatcher};
use ecm_repo::{Document, Repository, Session};
use ecm_types::ProviderId;

pub const REPOSITORY: &str = "test";

pub fn pid(s: &str) -> ProviderId {
    ProviderId::new(s).unwrap()
}

pub struct Fixture {
    pub repo: Arc<Repository>,
    pub stores: BTreeMap<&'static str, Arc<InMemoryBlobStore>>,
}

impl Fixture {
    pub fn manager(&self) -> &DocumentBlobManager {
        self.repo.blob_manager()
    }

    /// Content of the main blob of a committed document.
    pub fn content_of(&self, doc: &Document) -> Vec<u8> {
        let key = doc.content().and_then(Blob::key).expect("document has content");
        self.manager().read_blob(key, REPOSITORY).unwrap()
    }

    pub fn content_key(&self, doc: &Document) -> String {
        doc.content()
            .and_then(Blob::key)
            .map(ToString::to_string)
            .expect("document has content")
    }

    /// Create `name` under the root with `data` as main blob and commit.
    pub fn create_file(&self, name: &str, data: &[u8], mime: &str) -> Document {
        let mut session = self.repo.open_session();
        let doc = session
            .create(
                Document::new(self.repo.root_id(), name, "File")
                    .with_content(Blob::from_bytes(data.to_vec()).with_mime_type(mime)),
            )
            .unwrap();
        session.commit().unwrap();
        doc
    }

    pub fn session(&self) -> Session<'_> {
        self.repo.open_session()
    }
}

/// Providers `test` and `test2` behind a `video/` mime-prefix dispatcher,
/// both with record companion `records1`.
///
/// With `shared`, `test` and `test2` write to the same store.
pub fn fixture(shared: bool, gc_min_age: Duration) -> Fixture {
    let mut stores = BTreeMap::new();
    let main = Arc::new(InMemoryBlobStore::new("main"));
    let videos = if shared {
        main.clone()
    } else {
        Arc::new(InMemoryBlobStore::new("videos"))
    };
    let records = Arc::new(InMemoryBlobStore::new("records"));
    stores.insert("test", main.clone());
    stores.insert("test2", videos.clone());
    stores.insert("records1", records.clone());

    let mut registry = ProviderRegistry::new();
    registry
        .register(Arc::new(StoreBlobProvider::new(
            ProviderDescriptor::new(pid("test")).with_record_provider(pid("records1")),
            main,
            gc_min_age,
        )))
        .unwrap();
    registry
        .register(Arc::new(StoreBlobProvider::new(
            ProviderDescriptor::new(pid("test2")).with_record_provider(pid("records1")),
            videos,
            gc_min_age,
        )))
        .unwrap();
    registry
        .register(Arc::new(StoreBlobProvider::new(
            ProviderDescriptor::new(pid("records1")).record_mode(),
            records,
            gc_min_age,
        )))
        .unwrap();

    let dispatcher = MimePrefixDispatcher::new(vec![pid("test"), pid("test2")], "video/").unwrap();
    let manager = DocumentBlobManager::new(registry, Box::new(dispatcher)).unwrap();
    Fixture {
        repo: Arc::new(Repository::new(REPOSITORY, Arc::new(manager))),
        stores,
    }
}

pub fn default_fixture() -> Fixture {
    fixture(false, Duration::ZERO)
}
