//! Deduplicating, rate-limited work queue shared by every controller.
//!
//! A key is in at most one of three places: the ready FIFO, the processing
//! set, or both the processing and dirty sets when it was re-added while a
//! worker held it. `done` moves such a key back onto the FIFO, so a burst of
//! adds during a long sync collapses into exactly one follow-up run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Per-key exponential backoff applied by [`WorkQueue::add_rate_limited`].
#[derive(Clone, Debug)]
pub struct ItemBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl ItemBackoff {
    fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

struct QueueState<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    backoff: ItemBackoff,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: &str, backoff: ItemBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                backoff,
                state: Mutex::new(QueueState {
                    ready: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds `key` unless it is already waiting. A key currently being
    /// processed is marked dirty and requeued by [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(queue = %self.inner.name, ?key, "key in flight, deferring");
            return;
        }
        state.ready.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    pub fn add_after(&self, key: K, delay: Duration) {
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

    /// Re-adds `key` after its exponential backoff delay and bumps its
    /// failure count.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the backoff state of `key`.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next ready key. Returns `None` once the queue is shut
    /// down. Every returned key must be handed back through `done`.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.ready.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys and wakes every waiting worker. Keys already
    /// handed out stay valid until their `done`.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
