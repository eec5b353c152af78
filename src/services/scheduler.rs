//! Coalescing scheduler — keyed debounce and throttle.
//!
//! DESIGN
//! ======
//! Debounce: each key owns at most one pending task. Scheduling under a key
//! aborts the previous task outright (its captured payload is dropped, never
//! run) and spawns a new one that sleeps for the delay, then runs. The
//! action future captures its data at schedule time, so "last call wins"
//! falls out of replacing the task.
//!
//! Throttle: a map of key -> last accepted instant. A call is accepted when
//! at least the minimum interval has elapsed since the previous acceptance.
//!
//! ERROR HANDLING
//! ==============
//! A failed action is logged and forgotten. The pending record is removed
//! before the action runs, so a failure (or a new schedule arriving while the
//! action is in flight) never blocks or aborts later work under that key.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

struct PendingTask {
    seq: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerInner {
    pending: HashMap<String, PendingTask>,
    throttled: HashMap<String, Instant>,
    next_seq: u64,
}

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // DEBOUNCE
    // =========================================================================

    /// Run `action` after `delay`, replacing anything pending under `key`.
    pub fn schedule_debounced<F, E>(&self, key: impl Into<String>, delay: Duration, action: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = key.into();
        let mut inner = self.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;

        if let Some(previous) = inner.pending.remove(&key) {
            previous.handle.abort();
            debug!(%key, "debounce: superseded pending action");
        }

        let scheduler = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.finish(&task_key, seq);
            match action.await {
                Ok(()) => debug!(key = %task_key, "debounce: action completed"),
                Err(e) => error!(key = %task_key, error = %e, "debounce: action failed"),
            }
        });

        inner.pending.insert(key, PendingTask { seq, handle });
    }

    /// Drop the pending record for `key` if it still belongs to task `seq`.
    fn finish(&self, key: &str, seq: u64) {
        let mut inner = self.lock();
        if inner.pending.get(key).is_some_and(|p| p.seq == seq) {
            inner.pending.remove(key);
        }
    }

    /// Cancel the pending action under `key`. Returns whether one was pending.
    /// Safe to call any number of times.
    pub fn cancel(&self, key: &str) -> bool {
        let Some(pending) = self.lock().pending.remove(key) else {
            return false;
        };
        pending.handle.abort();
        true
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().pending.contains_key(key)
    }

    #[cfg(test)]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    // =========================================================================
    // THROTTLE
    // =========================================================================

    /// Accept a call under `key` if `min_interval` has elapsed since the last
    /// accepted one. Accepted calls become the new baseline.
    pub fn throttle(&self, key: &str, min_interval: Duration) -> bool {
        self.throttle_at(key, min_interval, Instant::now())
    }

    /// Internal: throttle with explicit timestamp (for testing).
    pub(crate) fn throttle_at(&self, key: &str, min_interval: Duration, now: Instant) -> bool {
        let mut inner = self.lock();
        if let Some(last) = inner.throttled.get(key) {
            if now.saturating_duration_since(*last) < min_interval {
                return false;
            }
        }
        inner.throttled.insert(key.to_owned(), now);
        true
    }

    /// Forget the throttle baseline for `key`.
    pub fn reset_throttle(&self, key: &str) {
        self.lock().throttled.remove(key);
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;
