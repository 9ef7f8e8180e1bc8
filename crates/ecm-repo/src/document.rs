use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use ecm_blob::{Blob, MAIN_BLOB_XPATH};
use ecm_dispatch::DocumentContext;
use ecm_types::DocumentId;

/// Link from a version snapshot to its live document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub live: DocumentId,
    pub number: u32,
}

impl VersionInfo {
    pub fn label(&self) -> String {
        format!("{}.0", self.number)
    }
}

/// A document as stored by the repository.
///
/// `is_record`, `legal_hold` and `retain_until` are owned by the repository:
/// they change only through `Session::make_record`, `Session::set_legal_hold`
/// and `Session::set_retain_until`. Values set directly on a document passed
/// to `Session::save` are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub parent: Option<DocumentId>,
    pub name: String,
    pub doc_type: String,
    pub properties: BTreeMap<String, String>,
    /// Blob properties by xpath.
    pub blobs: BTreeMap<String, Blob>,
    pub is_record: bool,
    pub legal_hold: bool,
    /// Record content cannot change before this date.
    #[serde(default)]
    pub retain_until: Option<SystemTime>,
    pub version: Option<VersionInfo>,
}

impl Document {
    pub fn new(parent: DocumentId, name: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            id: DocumentId::new(),
            parent: Some(parent),
            name: name.into(),
            doc_type: doc_type.into(),
            properties: BTreeMap::new(),
            blobs: BTreeMap::new(),
            is_record: false,
            legal_hold: false,
            retain_until: None,
            version: None,
        }
    }

    pub(crate) fn root() -> Self {
        Self {
            id: DocumentId::new(),
            parent: None,
            name: String::new(),
            doc_type: "Root".into(),
            properties: BTreeMap::new(),
            blobs: BTreeMap::new(),
            is_record: false,
            legal_hold: false,
            retain_until: None,
            version: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, blob: Blob) -> Self {
        self.set_content(Some(blob));
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn blob(&self, xpath: &str) -> Option<&Blob> {
        self.blobs.get(xpath)
    }

    pub fn set_blob(&mut self, xpath: impl Into<String>, blob: Option<Blob>) {
        let xpath = xpath.into();
        match blob {
            Some(blob) => self.blobs.insert(xpath, blob),
            None => self.blobs.remove(&xpath),
        };
    }

    /// Main blob (`content` xpath).
    pub fn content(&self) -> Option<&Blob> {
        self.blob(MAIN_BLOB_XPATH)
    }

    pub fn set_content(&mut self, blob: Option<Blob>) {
        self.set_blob(MAIN_BLOB_XPATH, blob);
    }

    pub fn is_version(&self) -> bool {
        self.version.is_some()
    }

    /// Under legal hold, or retained until a date still in the future.
    pub fn is_retained(&self) -> bool {
        self.legal_hold || self.retain_until.is_some_and(|date| date > SystemTime::now())
    }

    /// Drop record state; used for copies and version snapshots.
    pub(crate) fn clear_record_state(&mut self) {
        self.is_record = false;
        self.legal_hold = false;
        self.retain_until = None;
    }

    pub fn context<'a>(&'a self, repository: &'a str) -> DocumentContext<'a> {
        DocumentContext {
            repository,
            doc_id: &self.id,
            doc_type: &self.doc_type,
            is_record: self.is_record,
            retained: self.is_retained(),
            properties: &self.properties,
        }
    }
}
