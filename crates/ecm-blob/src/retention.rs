use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::debug;

/// Legal holds and retain-until dates of record keys.
///
/// Shared between a record-mode provider and its garbage collector, so a key
/// the provider refuses to overwrite is also never swept.
#[derive(Debug, Default)]
pub struct Retention {
    holds: RwLock<HashSet<String>>,
    until: RwLock<HashMap<String, SystemTime>>,
}

impl Retention {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_legal_hold(&self, key: &str, hold: bool) {
        let mut holds = self.holds.write().expect("lock poisoned");
        if hold {
            holds.insert(key.to_string());
        } else {
            holds.remove(key);
        }
        debug!(key, hold, "legal hold updated");
    }

    /// Set or clear the retain-until date of `key`.
    pub fn set_retain_until(&self, key: &str, until: Option<SystemTime>) {
        let mut dates = self.until.write().expect("lock poisoned");
        match until {
            Some(date) => {
                dates.insert(key.to_string(), date);
            }
            None => {
                dates.remove(key);
            }
        }
        debug!(key, ?until, "retain-until updated");
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.holds.read().expect("lock poisoned").contains(key)
    }

    pub fn retain_until(&self, key: &str) -> Option<SystemTime> {
        self.until.read().expect("lock poisoned").get(key).copied()
    }

    /// Held, or retained until a date that has not passed yet.
    pub fn is_retained(&self, key: &str) -> bool {
        self.is_held(key) || self.retain_until(key).is_some_and(|date| date > SystemTime::now())
    }
}
