use std::collections::BTreeMap;

use tracing::debug;

use ecm_blob::Blob;
use ecm_types::ProviderId;

use crate::dispatcher::{BlobDispatch, BlobDispatcher, DocumentContext};
use crate::error::{DispatchError, DispatchResult};

pub const PROVIDERS_PROPERTY: &str = "providers";
pub const PREFIX_PROPERTY: &str = "prefix";
pub const DEFAULT_MIME_PREFIX: &str = "video/";

/// Routes blobs whose MIME type starts with a prefix to the second provider
/// and everything else to the first.
#[derive(Clone, Debug)]
pub struct MimePrefixDispatcher {
    ids: Vec<ProviderId>,
    prefix: String,
}

impl MimePrefixDispatcher {
    /// At least two providers are required.
    pub fn new(ids: Vec<ProviderId>, prefix: impl Into<String>) -> DispatchResult<Self> {
        if ids.len() < 2 {
            return Err(DispatchError::config(format!(
                "mime prefix dispatcher needs at least two providers, got {}",
                ids.len()
            )));
        }
        Ok(Self {
            ids,
            prefix: prefix.into(),
        })
    }

    /// Build from raw properties: `providers` is a whitespace-separated id
    /// list, `prefix` defaults to `video/`.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> DispatchResult<Self> {
        let raw = properties
            .get(PROVIDERS_PROPERTY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::config("missing providers property"))?;
        let ids = raw
            .split_whitespace()
            .map(ProviderId::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DispatchError::config(e.to_string()))?;
        let prefix = properties
            .get(PREFIX_PROPERTY)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MIME_PREFIX.to_string());
        Self::new(ids, prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl BlobDispatcher for MimePrefixDispatcher {
    fn provider_ids(&self) -> &[ProviderId] {
        &self.ids
    }

    fn default_provider(&self, _repository: &str) -> &ProviderId {
        &self.ids[0]
    }

    fn dispatch(&self, blob: &Blob, _doc: &DocumentContext<'_>, xpath: &str) -> BlobDispatch {
        let matched = blob
            .mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with(&self.prefix));
        let target = if matched { &self.ids[1] } else { &self.ids[0] };
        debug!(xpath, mime = ?blob.mime_type, provider = %target, "blob dispatched by mime prefix");
        BlobDispatch::for_blob(target.clone(), true, blob)
    }

    fn name(&self) -> &'static str {
        "mime-prefix"
    }
}

#[cfg(test)]
mod tests {
    use ecm_types::DocumentId;

    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn route(dispatcher: &MimePrefixDispatcher, mime: Option<&str>) -> BlobDispatch {
        let id = DocumentId::new();
        let properties = BTreeMap::new();
        let doc = DocumentContext {
            repository: "test",
            doc_id: &id,
            doc_type: "File",
            is_record: false,
            retained: false,
            properties: &properties,
        };
        let mut blob = Blob::from_bytes(b"data".to_vec());
        if let Some(m) = mime {
            blob.set_mime_type(m);
        }
        dispatcher.dispatch(&blob, &doc, "content")
    }

    #[test]
    fn video_goes_to_second_provider() {
        let d = MimePrefixDispatcher::from_properties(&props(&[("providers", "test test2")])).unwrap();
        assert_eq!(route(&d, Some("video/mp4")).provider_id, "test2");
        assert_eq!(route(&d, Some("text/plain")).provider_id, "test");
        assert_eq!(route(&d, None).provider_id, "test");
        assert!(route(&d, None).add_prefix);
        assert_eq!(d.default_provider("test"), "test");
        assert_eq!(d.prefix(), "video/");
    }

    #[test]
    fn custom_prefix() {
        let d = MimePrefixDispatcher::from_properties(&props(&[
            ("providers", "main images"),
            ("prefix", "image/"),
        ]))
        .unwrap();
        assert_eq!(route(&d, Some("image/png")).provider_id, "images");
        assert_eq!(route(&d, Some("video/mp4")).provider_id, "main");
    }

    #[test]
    fn rejects_malformed_properties() {
        for bad in [
            props(&[]),
            props(&[("providers", "")]),
            props(&[("providers", "   ")]),
            props(&[("providers", "only")]),
            props(&[("providers", "a b:c")]),
        ] {
            let err = MimePrefixDispatcher::from_properties(&bad).unwrap_err();
            assert!(matches!(err, DispatchError::Configuration(_)), "{bad:?}");
        }
    }
}
