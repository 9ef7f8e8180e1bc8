use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ecm_types::ProviderId;

use crate::error::{BlobError, BlobResult};
use crate::provider::BlobProvider;

/// Explicit, constructible set of blob providers.
///
/// Built once at startup and read concurrently afterwards; there is no
/// global lookup.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn BlobProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its descriptor id.
    pub fn register(&mut self, provider: Arc<dyn BlobProvider>) -> BlobResult<()> {
        let id = provider.id().clone();
        if self.providers.contains_key(&id) {
            return Err(BlobError::DuplicateProvider(id));
        }
        self.providers.insert(id, provider);
        Ok(())
    }

    pub fn get(&self, id: &ProviderId) -> Option<&Arc<dyn BlobProvider>> {
        self.providers.get(id)
    }

    /// Like [`get`](Self::get) but failing with `UnknownProvider`.
    pub fn require(&self, id: &ProviderId) -> BlobResult<&Arc<dyn BlobProvider>> {
        self.providers
            .get(id)
            .ok_or_else(|| BlobError::UnknownProvider(id.to_string()))
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &ProviderId> {
        self.providers.keys()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Record-mode companion of a provider.
    ///
    /// A record-mode provider is its own companion.
    pub fn record_companion(&self, id: &ProviderId) -> Option<ProviderId> {
        let provider = self.providers.get(id)?;
        if provider.is_record_mode() {
            return Some(id.clone());
        }
        provider.record_provider().cloned()
    }

    /// Storage ids reached by more than one of `ids` through a collector.
    pub fn shared_storages<'a>(&self, ids: impl IntoIterator<Item = &'a ProviderId>) -> Vec<String> {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        let unique: BTreeSet<&ProviderId> = ids.into_iter().collect();
        for id in unique {
            if let Some(gc) = self.providers.get(id).and_then(|p| p.garbage_collector()) {
                *seen.entry(gc.id().to_string()).or_default() += 1;
            }
        }
        seen.into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(storage, _)| storage)
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
