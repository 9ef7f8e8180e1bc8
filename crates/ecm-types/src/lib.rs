//! Foundation types for the ECM document core.
//!
//! Every other `ecm-*` crate depends on `ecm-types`. It defines the
//! identifiers shared across crate boundaries and the wire format of managed
//! blob keys.
//!
//! # Key Types
//!
//! - [`DocumentId`] — UUID v7 identity of a document or version
//! - [`ProviderId`] — name of a registered blob provider
//! - [`TransactionId`] — repository transaction that staged record writes belong to
//! - [`BlobKey`] — parsed `providerId:backendKey` reference (or a bare legacy key)

pub mod error;
pub mod id;
pub mod key;

pub use error::TypeError;
pub use id::{DocumentId, ProviderId, TransactionId};
pub use key::BlobKey;
