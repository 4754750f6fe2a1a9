//! Per-endpoint rate-limit windows learned from 429 responses.
//!
//! The registry is a last-write-wins map from endpoint key to [`RateLimitWindow`]. Every write
//! gets a fresh stamp, and consumption is compare-and-delete on that stamp: a waiter that wakes
//! up removes the window only if it is still the one it waited on. If a concurrent 429
//! refreshed the entry during the wait, the fresher window stays and the waiter waits again.
//!
//! Reads only report live windows (`reset_at` strictly in the future); expired entries are
//! purged as they are encountered, and in bulk by [`RateLimitRegistry::purge_expired`], which
//! the reaper calls on every sweep.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// An interval during which one endpoint is known to reject requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Clock reading (ms) at which the endpoint is expected to accept requests again.
    pub reset_at_millis: u64,
    /// Number of 429s recorded against this endpoint since the window was last consumed.
    pub retry_count: u32,
    stamp: u64,
}

impl RateLimitWindow {
    /// Time left until `reset_at_millis` as seen from `now_millis`.
    pub fn remaining(&self, now_millis: u64) -> Duration {
        Duration::from_millis(self.reset_at_millis.saturating_sub(now_millis))
    }

    /// Identifies this particular write; used for compare-and-delete.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
}

/// Last-write-wins map of active windows, keyed by endpoint.
#[derive(Debug)]
pub struct RateLimitRegistry {
    windows: Mutex<HashMap<String, RateLimitWindow>>,
    next_stamp: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { windows: Mutex::new(HashMap::new()), next_stamp: AtomicU64::new(1), clock }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The live window for `endpoint`, if any. Purges an expired entry.
    pub fn get(&self, endpoint: &str) -> Option<RateLimitWindow> {
        let now = self.clock.now_millis();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        match windows.get(endpoint) {
            Some(w) if w.reset_at_millis > now => Some(*w),
            Some(_) => {
                windows.remove(endpoint);
                None
            }
            None => None,
        }
    }

    pub fn is_limited(&self, endpoint: &str) -> bool {
        self.get(endpoint).is_some()
    }

    /// Write a window that resets `delay` from now, overwriting whatever was there.
    ///
    /// `retry_count` carries over from the replaced entry and is incremented.
    pub fn record(&self, endpoint: &str, delay: Duration) -> RateLimitWindow {
        let now = self.clock.now_millis();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        // A zero delay would produce a window that is already expired.
        let reset_at_millis = now.saturating_add(delay_ms.max(1));
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let retry_count = windows.get(endpoint).map_or(0, |w| w.retry_count).saturating_add(1);
        let window = RateLimitWindow { reset_at_millis, retry_count, stamp };
        windows.insert(endpoint.to_string(), window);
        drop(windows);

        debug!(
            target: "egress_guard::rate_limit",
            endpoint,
            delay_ms,
            retry_count,
            "rate-limit window recorded"
        );
        window
    }

    /// Remove the window for `endpoint` if it is still the write identified by `stamp`.
    ///
    /// Returns `true` when the caller may proceed: either it removed its window or the entry
    /// is already gone. Returns `false` when a newer window replaced it.
    pub fn consume(&self, endpoint: &str, stamp: u64) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        match windows.get(endpoint) {
            Some(current) if current.stamp == stamp => {
                windows.remove(endpoint);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Drop the window for `endpoint` unconditionally.
    pub fn remove(&self, endpoint: &str) -> Option<RateLimitWindow> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).remove(endpoint)
    }

    /// Drop every window that has already reset. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| w.reset_at_millis > now);
        before - windows.len()
    }

    /// Number of stored entries, expired ones included until they are read or purged.
    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
