//! Rate-limited, deduplicating work queue.
//!
//! Workers pull `namespace/name` keys from the queue. A key lives in at most
//! one place at a time: queued, or in flight with a worker. Adding a key that
//! is in flight marks it dirty and `done` puts it back, so the same resource is
//! never synced by two workers concurrently and bursts of changes collapse
//! into a single sync.
//!
//! This is the only synchronization primitive on the reconciliation path.

use crate::backoff::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug)]
struct State {
    /// Keys ready to be handed out, in insertion order
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    shutting_down: bool,
    limiter: RateLimiter,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

/// Shared handle to a named work queue. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates a queue whose retries are paced by `limiter`.
    pub fn new(name: impl Into<String>, limiter: impl Into<RateLimiter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                    limiter: limiter.into(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Nothing panics while holding the lock, but never poison the queue for every worker
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing.
    ///
    /// No-op if the key is already queued. If it is in flight the key is
    /// remembered and re-queued when the worker calls [`WorkQueue::done`].
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!("{}: deferring {} until in-flight sync is done", self.inner.name, key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-adds `key` once the rate limiter allows it: the longer of its
    /// per-key backoff and the overall retry budget.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.state().limiter.when(&key);
        debug!("{}: requeueing {} in {:?}", self.inner.name, key, delay);
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`, resetting its backoff.
    pub fn forget(&self, key: &str) {
        self.state().limiter.forget(key);
    }

    /// Number of consecutive rate-limited requeues of `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().limiter.num_requeues(key)
    }

    /// Longest per-key retry delay.
    pub fn max_delay(&self) -> Duration {
        self.state().limiter.max_delay()
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue is shut down and drained. Every `Some`
    /// must be followed by exactly one [`WorkQueue::done`] for that key.
    pub async fn get(&self) -> Option<String> {
        loop {
            // Register interest before inspecting state so a concurrent add or
            // shutdown cannot slip between the check and the wait
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases the in-flight marker for `key`, re-queueing it if it was
    /// added again while being processed.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting new keys. Queued keys are still handed out; once the
    /// queue is empty every blocked and future `get` returns `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        debug!("{}: shutting down", self.inner.name);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no keys are waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
