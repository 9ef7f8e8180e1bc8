use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::LockError;

/// Cooperative interruption handle for a waiting caller.
///
/// Triggering the handle makes a pending [`KeyedLockCoordinator::do_atomically_interruptible`]
/// call give up with [`LockError::Interrupted`]. The handle stays triggered
/// afterwards so outer code can observe it.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Slot {
    mutex: Arc<ReentrantMutex<()>>,
    users: usize,
}

/// Serializes work per string key within one process.
///
/// Callers racing on the same key run their actions one at a time; callers
/// on different keys never block each other. Locks are reentrant, so an
/// action may call back into the coordinator for the key it already holds.
/// Entries exist only while some caller holds or waits for them.
pub struct KeyedLockCoordinator {
    config: LockConfig,
    table: Mutex<HashMap<String, Slot>>,
    shutdown: AtomicBool,
}

/// Registration of one caller on a key; retires the entry when the last
/// caller leaves.
struct Lease<'a> {
    coordinator: &'a KeyedLockCoordinator,
    key: &'a str,
    mutex: Arc<ReentrantMutex<()>>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut table = self.coordinator.table.lock();
        if let Some(slot) = table.get_mut(self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                table.remove(self.key);
            }
        }
    }
}

impl KeyedLockCoordinator {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Run `action` while holding the lock for `key`.
    ///
    /// Waits up to the configured timeout; on expiry fails with
    /// [`LockError::ConcurrentUpdate`] without running the action. Errors
    /// from the action propagate unchanged and the lock is released in every
    /// outcome, including panics.
    pub fn do_atomically<T, E, F>(&self, key: &str, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        self.run(key, None, action)
    }

    /// Like [`do_atomically`](Self::do_atomically), also giving up when
    /// `interrupt` is triggered while waiting.
    pub fn do_atomically_interruptible<T, E, F>(
        &self,
        key: &str,
        interrupt: &Interrupt,
        action: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        self.run(key, Some(interrupt), action)
    }

    /// Wake all waiters with `Interrupted` and refuse new callers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        debug!(waiting = self.len(), "lock coordinator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Keys currently held or waited for.
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn run<T, E, F>(&self, key: &str, interrupt: Option<&Interrupt>, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LockError>,
    {
        let lease = self.checkout(key);
        let guard = self.acquire(key, &lease.mutex, interrupt)?;
        let result = action();
        drop(guard);
        drop(lease);
        result
    }

    fn checkout<'a>(&'a self, key: &'a str) -> Lease<'a> {
        let mut table = self.table.lock();
        let slot = table.entry(key.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(ReentrantMutex::new(())),
            users: 0,
        });
        slot.users += 1;
        Lease {
            coordinator: self,
            key,
            mutex: Arc::clone(&slot.mutex),
        }
    }

    fn acquire<'m>(
        &self,
        key: &str,
        mutex: &'m ReentrantMutex<()>,
        interrupt: Option<&Interrupt>,
    ) -> Result<ReentrantMutexGuard<'m, ()>, LockError> {
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let slice = self.config.poll_interval();
        loop {
            if self.is_shut_down() || interrupt.is_some_and(Interrupt::is_triggered) {
                debug!(key, "lock wait interrupted");
                return Err(LockError::Interrupted {
                    key: key.to_string(),
                });
            }
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if let Some(guard) = mutex.try_lock_for(remaining.min(slice)) {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                warn!(key, timeout_ms = timeout.as_millis() as u64, "lock wait timed out");
                return Err(LockError::ConcurrentUpdate {
                    key: key.to_string(),
                });
            }
        }
    }
}

impl Default for KeyedLockCoordinator {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl std::fmt::Debug for KeyedLockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockCoordinator")
            .field("config", &self.config)
            .field("keys", &self.len())
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}
