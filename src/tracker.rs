//! In-flight call tracking.
//!
//! Every top-level call registers an entry at dispatch and removes it when it settles. A call
//! whose future is dropped removes its entry through [`TrackingGuard`]; the reaper sweeps up
//! whatever is left behind by futures that are neither polled to completion nor dropped.

use crate::clock::Clock;
use crate::request::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// What a tracked call was doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMetadata {
    pub service_key: String,
    pub endpoint: String,
    pub method: Method,
    /// 1-based transport attempt currently in progress.
    pub attempt: usize,
}

/// A dispatched call whose outcome has not been observed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntry {
    pub handle: u64,
    pub started_at_millis: u64,
    pub metadata: TrackedMetadata,
}

/// Table of in-flight calls owned by one executor.
#[derive(Debug)]
pub struct InFlightTracker {
    entries: Mutex<HashMap<u64, TrackedEntry>>,
    next_handle: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InFlightTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), next_handle: AtomicU64::new(1), clock }
    }

    pub fn register(&self, metadata: TrackedMetadata) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let entry = TrackedEntry { handle, started_at_millis: self.clock.now_millis(), metadata };
        self.lock().insert(handle, entry);
        handle
    }

    /// Update the attempt number of a live entry. No-op if it was already removed.
    pub fn set_attempt(&self, handle: u64, attempt: usize) {
        if let Some(entry) = self.lock().get_mut(&handle) {
            entry.metadata.attempt = attempt;
        }
    }

    pub fn remove(&self, handle: u64) -> bool {
        self.lock().remove(&handle).is_some()
    }

    /// Remove every entry older than `stale_after`; returns how many were removed.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        let now = self.clock.now_millis();
        let threshold = u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let age = now.saturating_sub(entry.started_at_millis);
            let keep = age <= threshold;
            if !keep {
                warn!(
                    target: "egress_guard::reaper",
                    handle = entry.handle,
                    service_key = %entry.metadata.service_key,
                    endpoint = %entry.metadata.endpoint,
                    age_ms = age,
                    "reaping stale in-flight entry"
                );
            }
            keep
        });
        before - entries.len()
    }

    /// Entries sorted by handle (dispatch order).
    pub fn snapshot(&self) -> Vec<TrackedEntry> {
        let mut entries: Vec<TrackedEntry> = self.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.handle);
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TrackedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its entry when dropped, whether the call settled or was abandoned.
#[derive(Debug)]
pub(crate) struct TrackingGuard {
    tracker: Arc<InFlightTracker>,
    handle: u64,
}

impl TrackingGuard {
    pub(crate) fn register(tracker: Arc<InFlightTracker>, metadata: TrackedMetadata) -> Self {
        let handle = tracker.register(metadata);
        Self { tracker, handle }
    }

    pub(crate) fn set_attempt(&self, attempt: usize) {
        self.tracker.set_attempt(self.handle, attempt);
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.handle);
    }
}
