//! Keyed lock coordination for the ECM document core.
//!
//! Concurrent "get-or-create" flows race on the same logical key (for
//! example `<repository>-<parentId>-<name>`). [`KeyedLockCoordinator`]
//! serializes them per key in-process, with a bounded wait that surfaces as
//! [`LockError::ConcurrentUpdate`].

pub mod config;
pub mod coordinator;
pub mod error;

pub use config::LockConfig;
pub use coordinator::{Interrupt, KeyedLockCoordinator};
pub use error::{LockError, Result};
