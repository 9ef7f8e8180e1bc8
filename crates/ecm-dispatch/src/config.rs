use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use ecm_blob::{
    BlobStore, FileSystemBlobStore, InMemoryBlobStore, ProviderDescriptor, ProviderRegistry,
    StoreBlobProvider,
};
use ecm_lock::{KeyedLockCoordinator, LockConfig};
use ecm_types::ProviderId;

use crate::dispatcher::{BlobDispatcher, SingleProviderDispatcher};
use crate::error::{DispatchError, DispatchResult};
use crate::manager::DocumentBlobManager;
use crate::mime_prefix::{MimePrefixDispatcher, PREFIX_PROPERTY, PROVIDERS_PROPERTY};
use crate::rules::{DispatchRule, RuleDispatcher};

/// Binary garbage collection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Binaries younger than this are never collected.
    pub min_age_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { min_age_secs: 3600 }
    }
}

impl GcConfig {
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

/// Physical storage behind a provider.
///
/// Memory stores with the same name, and file stores with the same path,
/// are the same storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoreConfig {
    Memory { name: String },
    Fs { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    pub store: StoreConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DispatcherConfig {
    Single {
        provider: ProviderId,
    },
    MimePrefix {
        providers: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Rules {
        default: ProviderId,
        #[serde(default)]
        rules: Vec<DispatchRule>,
    },
}

impl DispatcherConfig {
    pub fn build(&self) -> DispatchResult<Box<dyn BlobDispatcher>> {
        let dispatcher: Box<dyn BlobDispatcher> = match self {
            Self::Single { provider } => Box::new(SingleProviderDispatcher::new(provider.clone())),
            Self::MimePrefix { providers, prefix } => {
                let mut properties = BTreeMap::new();
                properties.insert(PROVIDERS_PROPERTY.to_string(), providers.clone());
                if let Some(prefix) = prefix {
                    properties.insert(PREFIX_PROPERTY.to_string(), prefix.clone());
                }
                Box::new(MimePrefixDispatcher::from_properties(&properties)?)
            }
            Self::Rules { default, rules } => {
                Box::new(RuleDispatcher::new(default.clone(), rules.clone())?)
            }
        };
        Ok(dispatcher)
    }
}

/// Top-level configuration of the document blob core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobManagerConfig {
    /// Keyed lock settings for [`lock_coordinator`](Self::lock_coordinator).
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Optional when exactly one provider is configured.
    #[serde(default)]
    pub dispatcher: Option<DispatcherConfig>,
}

impl BlobManagerConfig {
    pub fn from_toml_str(raw: &str) -> DispatchResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> DispatchResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_provider(mut self, descriptor: ProviderDescriptor, store: StoreConfig) -> Self {
        self.providers.push(ProviderConfig { descriptor, store });
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_gc_min_age(mut self, min_age: Duration) -> Self {
        self.gc.min_age_secs = min_age.as_secs();
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Coordinator for get-or-create and other keyed critical sections,
    /// with the configured timeout and poll interval.
    pub fn lock_coordinator(&self) -> KeyedLockCoordinator {
        KeyedLockCoordinator::new(self.lock.clone())
    }

    fn dispatcher_config(&self) -> DispatchResult<DispatcherConfig> {
        if let Some(dispatcher) = &self.dispatcher {
            return Ok(dispatcher.clone());
        }
        match self.providers.as_slice() {
            [only] => Ok(DispatcherConfig::Single {
                provider: only.descriptor.id.clone(),
            }),
            [] => Err(DispatchError::config("no blob providers configured")),
            _ => Err(DispatchError::config(
                "a dispatcher is required when several blob providers are configured",
            )),
        }
    }

    /// Open the stores, register the providers and build the manager.
    pub fn build(&self) -> DispatchResult<DocumentBlobManager> {
        let mut stores: HashMap<StoreConfig, Arc<dyn BlobStore>> = HashMap::new();
        let mut registry = ProviderRegistry::new();
        for provider in &self.providers {
            let store = match stores.get(&provider.store) {
                Some(store) => store.clone(),
                None => {
                    let store = open_store(&provider.store)?;
                    stores.insert(provider.store.clone(), store.clone());
                    store
                }
            };
            if let Some(record_provider) = &provider.descriptor.record_provider {
                if !self.providers.iter().any(|p| &p.descriptor.id == record_provider) {
                    return Err(DispatchError::config(format!(
                        "provider {} names unknown record provider {record_provider}",
                        provider.descriptor.id
                    )));
                }
            }
            registry
                .register(Arc::new(StoreBlobProvider::new(
                    provider.descriptor.clone(),
                    store,
                    self.gc.min_age(),
                )))
                .map_err(|e| DispatchError::config(e.to_string()))?;
        }
        let dispatcher = self.dispatcher_config()?.build()?;
        info!(
            providers = registry.len(),
            dispatcher = dispatcher.name(),
            "blob providers configured"
        );
        DocumentBlobManager::new(registry, dispatcher)
    }
}

fn open_store(config: &StoreConfig) -> DispatchResult<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match config {
        StoreConfig::Memory { name } => Arc::new(InMemoryBlobStore::new(name)),
        StoreConfig::Fs { path } => Arc::new(FileSystemBlobStore::open(path)?),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use ecm_blob::Blob;
    use ecm_types::DocumentId;

    use super::*;
    use crate::dispatcher::DocumentContext;

    const SAMPLE: &str = r#"
        [lock]
        timeout_ms = 2000

        [gc]
        min_age_secs = 0

        [[providers]]
        id = "test"
        store = { kind = "memory", name = "shared" }
        record_provider = "records1"

        [[providers]]
        id = "test2"
        store = { kind = "memory", name = "shared" }
        record_provider = "records1"

        [[providers]]
        id = "records1"
        store = { kind = "memory", name = "records" }
        record = true

        [dispatcher]
        kind = "mime-prefix"
        providers = "test test2"
        prefix = "video/"
    "#;

    #[test]
    fn parses_sample() {
        let config = BlobManagerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.lock.timeout_ms, 2000);
        assert_eq!(config.gc.min_age(), Duration::ZERO);
        assert_eq!(config.providers.len(), 3);
        assert!(config.providers[2].descriptor.record);
        assert_eq!(
            config.providers[0].store,
            StoreConfig::Memory {
                name: "shared".into()
            }
        );
    }

    #[test]
    fn builds_manager_with_shared_memory_store() {
        let manager = BlobManagerConfig::from_toml_str(SAMPLE).unwrap().build().unwrap();
        assert!(manager.has_shared_storage());
        assert_eq!(manager.dispatcher().name(), "mime-prefix");

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
        let stored = manager
            .write_blob(Some(&Blob::from_bytes(b"v".to_vec()).with_mime_type("video/mp4")), &doc, "content")
            .unwrap()
            .unwrap();
        assert_eq!(stored.key().unwrap().provider().unwrap(), "test2");
    }

    #[test]
    fn lock_coordinator_uses_configured_timeout() {
        let config = BlobManagerConfig::from_toml_str(SAMPLE).unwrap();
        let locks = config.lock_coordinator();
        assert_eq!(locks.config().timeout(), Duration::from_millis(2000));

        let tuned = config.with_lock(LockConfig::new().with_timeout(Duration::from_millis(10)));
        assert_eq!(tuned.lock_coordinator().config().timeout(), Duration::from_millis(10));
    }

    #[test]
    fn defaults_apply() {
        let config = BlobManagerConfig::from_toml_str(
            r#"
            [[providers]]
            id = "default"
            store = { kind = "memory", name = "m" }
            "#,
        )
        .unwrap();
        assert_eq!(config.lock, LockConfig::default());
        assert_eq!(config.gc.min_age(), Duration::from_secs(3600));
        let manager = config.build().unwrap();
        assert_eq!(manager.dispatcher().name(), "single");
    }

    #[test]
    fn filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobManagerConfig::default()
            .with_provider(
                ProviderDescriptor::new(ProviderId::new("disk").unwrap()),
                StoreConfig::Fs {
                    path: dir.path().to_path_buf(),
                },
            )
            .with_gc_min_age(Duration::ZERO);
        let manager = config.build().unwrap();
        assert_eq!(manager.managed_provider_ids().len(), 1);
        assert!(!manager.has_shared_storage());
    }

    #[test]
    fn rejects_bad_configurations() {
        let cases = [
            // nothing configured
            "",
            // several providers, no dispatcher
            r#"
            [[providers]]
            id = "a"
            store = { kind = "memory", name = "a" }
            [[providers]]
            id = "b"
            store = { kind = "memory", name = "b" }
            "#,
            // mime prefix with one provider
            r#"
            [[providers]]
            id = "a"
            store = { kind = "memory", name = "a" }
            [dispatcher]
            kind = "mime-prefix"
            providers = "a"
            "#,
            // dispatcher routes to an unknown provider
            r#"
            [[providers]]
            id = "a"
            store = { kind = "memory", name = "a" }
            [dispatcher]
            kind = "single"
            provider = "zzz"
            "#,
            // unknown record provider
            r#"
            [[providers]]
            id = "a"
            store = { kind = "memory", name = "a" }
            record_provider = "missing"
            "#,
            // bad rule pattern
            r#"
            [[providers]]
            id = "a"
            store = { kind = "memory", name = "a" }
            [dispatcher]
            kind = "rules"
            default = "a"
            rules = [{ provider = "a", conditions = [{ field = "blob:name", op = "^", value = "(" }] }]
            "#,
        ];
        for raw in cases {
            let err = BlobManagerConfig::from_toml_str(raw).unwrap().build().unwrap_err();
            assert!(matches!(err, DispatchError::Configuration(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = BlobManagerConfig::from_toml_str("[[providers]]\nid = 3").unwrap_err();
        assert!(matches!(err, DispatchError::Toml(_)));
    }
}
