use serde::{Deserialize, Serialize};

use ecm_types::{BlobKey, ProviderId};

/// Content digest used as the storage key of regular providers.
///
/// BLAKE3, hex-encoded. Identical content always produces the same key, so
/// regular providers deduplicate writes.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Reference to content already stored by a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedRef {
    /// Provider that resolved the key (for legacy keys: the default provider).
    pub provider_id: ProviderId,
    /// Key as persisted in the document, prefix included when there is one.
    pub key: BlobKey,
    pub length: u64,
    pub digest: String,
}

/// Where the bytes of a [`Blob`] live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobSource {
    /// Fresh content that has not been written to any provider yet.
    Bytes(Vec<u8>),
    /// Content owned by a provider.
    Managed(ManagedRef),
}

/// A blob property value: content (or a reference to it) plus metadata.
///
/// Metadata changes on a managed blob do not touch storage by themselves; the
/// blob manager re-dispatches it the next time the owning document is saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub encoding: Option<String>,
    pub source: BlobSource,
}

impl Blob {
    /// A fresh blob holding `data`.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: None,
            filename: None,
            encoding: None,
            source: BlobSource::Bytes(data.into()),
        }
    }

    /// A blob that points at already stored content.
    pub fn managed(reference: ManagedRef) -> Self {
        Self {
            mime_type: None,
            filename: None,
            encoding: None,
            source: BlobSource::Managed(reference),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn set_mime_type(&mut self, mime_type: impl Into<String>) {
        self.mime_type = Some(mime_type.into());
    }

    /// The managed reference, if this blob is stored.
    pub fn managed_ref(&self) -> Option<&ManagedRef> {
        match &self.source {
            BlobSource::Managed(r) => Some(r),
            BlobSource::Bytes(_) => None,
        }
    }

    /// The full persisted key, if this blob is stored.
    pub fn key(&self) -> Option<&BlobKey> {
        self.managed_ref().map(|r| &r.key)
    }

    /// Content length in bytes.
    pub fn length(&self) -> u64 {
        match &self.source {
            BlobSource::Bytes(data) => data.len() as u64,
            BlobSource::Managed(r) => r.length,
        }
    }

    /// Content digest. Computed on the fly for fresh blobs.
    pub fn digest(&self) -> String {
        match &self.source {
            BlobSource::Bytes(data) => content_digest(data),
            BlobSource::Managed(r) => r.digest.clone(),
        }
    }

    /// Returns `true` if this blob references stored content.
    pub fn is_managed(&self) -> bool {
        matches!(self.source, BlobSource::Managed(_))
    }

    /// Same metadata, new source.
    pub fn with_source(&self, source: BlobSource) -> Self {
        Self {
            mime_type: self.mime_type.clone(),
            filename: self.filename.clone(),
            encoding: self.encoding.clone(),
            source,
        }
    }
}
