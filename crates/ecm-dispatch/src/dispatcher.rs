use std::collections::BTreeMap;

use ecm_blob::Blob;
use ecm_types::{DocumentId, ProviderId};

// ---------------------------------------------------------------------------
// Routing inputs and outputs
// ---------------------------------------------------------------------------

/// What a dispatcher may look at on the owning document.
#[derive(Clone, Copy, Debug)]
pub struct DocumentContext<'a> {
    pub repository: &'a str,
    pub doc_id: &'a DocumentId,
    pub doc_type: &'a str,
    pub is_record: bool,
    /// Under retention or legal hold.
    pub retained: bool,
    pub properties: &'a BTreeMap<String, String>,
}

/// Routing decision for one blob write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobDispatch {
    pub provider_id: ProviderId,
    /// Whether the stored key carries the `providerId:` prefix.
    pub add_prefix: bool,
    /// Content must be copied into the target provider before the document
    /// links to it.
    pub copy_before_link: bool,
}

impl BlobDispatch {
    /// Decision for `blob` targeting `provider_id`.
    pub fn for_blob(provider_id: ProviderId, add_prefix: bool, blob: &Blob) -> Self {
        let copy_before_link = match blob.managed_ref() {
            Some(current) => current.provider_id != provider_id,
            None => true,
        };
        Self {
            provider_id,
            add_prefix,
            copy_before_link,
        }
    }
}

/// Decides which provider stores a blob.
///
/// Implementations are immutable after construction and shared across
/// threads.
pub trait BlobDispatcher: Send + Sync {
    /// Every provider this dispatcher may route to, default first.
    fn provider_ids(&self) -> &[ProviderId];

    /// Provider resolving unprefixed (legacy) keys of `repository`.
    fn default_provider(&self, repository: &str) -> &ProviderId;

    /// Route a blob about to be written at `xpath` of the document.
    fn dispatch(&self, blob: &Blob, doc: &DocumentContext<'_>, xpath: &str) -> BlobDispatch;

    /// Short name for logs and the CLI.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// SingleProviderDispatcher
// ---------------------------------------------------------------------------

/// Everything goes to one provider, with unprefixed keys.
#[derive(Clone, Debug)]
pub struct SingleProviderDispatcher {
    ids: Vec<ProviderId>,
}

impl SingleProviderDispatcher {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            ids: vec![provider],
        }
    }
}

impl BlobDispatcher for SingleProviderDispatcher {
    fn provider_ids(&self) -> &[ProviderId] {
        &self.ids
    }

    fn default_provider(&self, _repository: &str) -> &ProviderId {
        &self.ids[0]
    }

    fn dispatch(&self, blob: &Blob, _doc: &DocumentContext<'_>, _xpath: &str) -> BlobDispatch {
        BlobDispatch::for_blob(self.ids[0].clone(), false, blob)
    }

    fn name(&self) -> &'static str {
        "single"
    }
}
