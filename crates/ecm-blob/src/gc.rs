use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BlobError, BlobResult};
use crate::retention::Retention;
use crate::traits::BlobStore;

/// Outcome of a binary garbage collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryManagerStatus {
    /// Binaries seen in the swept stores (live and garbage).
    pub num_binaries: u64,
    pub size_binaries: u64,
    /// Binaries found unreferenced and old enough (deleted unless dry run).
    pub num_binaries_gc: u64,
    pub size_binaries_gc: u64,
    pub gc_duration: Duration,
}

impl AddAssign<&BinaryManagerStatus> for BinaryManagerStatus {
    fn add_assign(&mut self, other: &BinaryManagerStatus) {
        self.num_binaries += other.num_binaries;
        self.size_binaries += other.size_binaries;
        self.num_binaries_gc += other.num_binaries_gc;
        self.size_binaries_gc += other.size_binaries_gc;
    }
}

impl std::fmt::Display for BinaryManagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "binaries={} ({} bytes), gc={} ({} bytes), duration={:?}",
            self.num_binaries,
            self.size_binaries,
            self.num_binaries_gc,
            self.size_binaries_gc,
            self.gc_duration
        )
    }
}

#[derive(Default)]
struct GcState {
    started: Option<(SystemTime, Instant)>,
    marked: HashSet<String>,
    status: BinaryManagerStatus,
}

/// Mark-and-sweep collector over one blob store.
///
/// Usage: [`start`](Self::start), [`mark`](Self::mark) every referenced key,
/// then [`stop`](Self::stop). Binaries written less than `min_age` before the
/// collection started are never collected, so in-flight writes whose document
/// is not committed yet survive. Keys under retention are never collected.
pub struct BinaryGarbageCollector {
    store: Arc<dyn BlobStore>,
    min_age: Duration,
    retention: Option<Arc<Retention>>,
    state: Mutex<GcState>,
}

impl BinaryGarbageCollector {
    pub fn new(store: Arc<dyn BlobStore>, min_age: Duration) -> Self {
        Self {
            store,
            min_age,
            retention: None,
            state: Mutex::new(GcState::default()),
        }
    }

    /// Skip keys that `retention` holds or retains.
    pub fn with_retention(mut self, retention: Arc<Retention>) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Collectors with the same id sweep the same physical storage.
    pub fn id(&self) -> &str {
        self.store.storage_id()
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    /// Begin a collection.
    pub fn start(&self) -> BlobResult<()> {
        let mut state = self.state.lock().expect("gc mutex poisoned");
        if state.started.is_some() {
            return Err(BlobError::GcInProgress(self.id().to_string()));
        }
        state.started = Some((SystemTime::now(), Instant::now()));
        state.marked.clear();
        state.status = BinaryManagerStatus::default();
        debug!(storage = self.id(), "binary gc started");
        Ok(())
    }

    /// Mark a backend key as referenced.
    pub fn mark(&self, key: &str) {
        let mut state = self.state.lock().expect("gc mutex poisoned");
        if state.started.is_some() {
            state.marked.insert(key.to_string());
        }
    }

    /// Sweep unmarked binaries, deleting them when `delete` is true.
    pub fn stop(&self, delete: bool) -> BlobResult<BinaryManagerStatus> {
        let mut state = self.state.lock().expect("gc mutex poisoned");
        let (started_at, clock) = state
            .started
            .ok_or_else(|| BlobError::GcNotStarted(self.id().to_string()))?;
        let result = self.sweep(&state.marked, started_at, delete);
        state.started = None;
        state.marked.clear();
        let mut status = result?;
        status.gc_duration = clock.elapsed();
        info!(storage = self.id(), %status, delete, "binary gc swept");
        state.status = status.clone();
        Ok(status)
    }

    fn sweep(
        &self,
        marked: &HashSet<String>,
        started_at: SystemTime,
        delete: bool,
    ) -> BlobResult<BinaryManagerStatus> {
        let cutoff = started_at.checked_sub(self.min_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut status = BinaryManagerStatus::default();
        for info in self.store.list()? {
            status.num_binaries += 1;
            status.size_binaries += info.size;
            if marked.contains(&info.key) || info.written_at > cutoff {
                continue;
            }
            if self.retention.as_ref().is_some_and(|r| r.is_retained(&info.key)) {
                debug!(storage = self.id(), key = %info.key, "retained binary kept");
                continue;
            }
            status.num_binaries_gc += 1;
            status.size_binaries_gc += info.size;
            if delete {
                self.store.delete(&info.key)?;
                debug!(storage = self.id(), key = %info.key, "binary deleted");
            }
        }
        Ok(status)
    }

    /// Status of the last completed collection.
    pub fn status(&self) -> BinaryManagerStatus {
        self.state.lock().expect("gc mutex poisoned").status.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.lock().expect("gc mutex poisoned").started.is_some()
    }
}

impl std::fmt::Debug for BinaryGarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryGarbageCollector")
            .field("storage", &self.id())
            .field("min_age", &self.min_age)
            .finish()
    }
}
