//! Request/response correlation
//!
//! Every outbound command gets a fresh id. The receiver task files responses
//! into a bounded insertion-ordered cache; synchronous callers wait on it by
//! id. Waiters are woken through a `watch` version counter and fall back to a
//! fixed poll interval, so a missed wake-up costs at most one interval.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::warn;

/// Monotonic command id source
#[derive(Debug)]
pub struct CommandIds {
    next: AtomicU64,
}

impl CommandIds {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Take the next id; never returns the same value twice
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next call will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    values: HashMap<u64, Value>,
    order: VecDeque<u64>,
}

/// Fixed-capacity response store, evicting the oldest insertion first
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    version: watch::Sender<u64>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
            version,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store the response for `id`, evicting the oldest entry when full
    pub fn insert(&self, id: u64, response: Value) {
        {
            let mut inner = self.lock();
            if inner.values.insert(id, response).is_none() {
                inner.order.push_back(id);
                while inner.order.len() > self.capacity {
                    if let Some(oldest) = inner.order.pop_front() {
                        inner.values.remove(&oldest);
                    }
                }
            }
        }
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn get(&self, id: u64) -> Option<Value> {
        self.lock().values.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().values.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently held, oldest first
    pub fn ids(&self) -> Vec<u64> {
        self.lock().order.iter().copied().collect()
    }

    /// Wait until a response for `id` arrives or `limit` elapses
    ///
    /// Logs a slow warning every `slow_after` while still waiting.
    pub async fn wait_for(
        &self,
        id: u64,
        method: &str,
        poll_interval: Duration,
        slow_after: Duration,
        limit: Duration,
    ) -> Option<Value> {
        let mut changes = self.version.subscribe();
        let start = Instant::now();
        let mut next_warning = slow_after;

        loop {
            if let Some(response) = self.get(id) {
                return Some(response);
            }

            let elapsed = start.elapsed();
            if elapsed >= limit {
                return None;
            }
            if !slow_after.is_zero() && elapsed >= next_warning {
                warn!(
                    "SLOW message response. {:.1}s elapsed waiting for {} (id {})",
                    elapsed.as_secs_f64(),
                    method,
                    id
                );
                next_warning += slow_after;
            }

            let wait = poll_interval.min(limit - elapsed);
            let _ = timeout(wait, changes.changed()).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
