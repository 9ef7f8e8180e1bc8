//! Blob dispatch for the ECM document core.
//!
//! A [`BlobDispatcher`] decides which provider stores each blob written to a
//! document; [`DocumentBlobManager`] applies that decision on every write,
//! redirects records to record-mode providers, enforces retention and legal
//! hold, resolves legacy unprefixed keys and orchestrates binary garbage
//! collection across providers.
//!
//! Dispatchers:
//!
//! - [`MimePrefixDispatcher`]: MIME prefix to a second provider
//! - [`RuleDispatcher`]: ordered metadata rules with a default provider
//! - [`SingleProviderDispatcher`]: one provider, unprefixed keys
//!
//! [`BlobManagerConfig`] loads all of it from TOML.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod mime_prefix;
pub mod rules;

pub use config::{BlobManagerConfig, DispatcherConfig, GcConfig, ProviderConfig, StoreConfig};
pub use dispatcher::{BlobDispatch, BlobDispatcher, DocumentContext, SingleProviderDispatcher};
pub use error::{DispatchError, DispatchResult};
pub use manager::{BlobReferences, DocumentBlobManager};
pub use mime_prefix::MimePrefixDispatcher;
pub use rules::{Clause, DispatchRule, Operator, RuleDispatcher};
