//! Live device status keyed by event name
//!
//! Each inbound event overwrites the entry for its name wholesale. A missing
//! entry means "unknown", never a terminal state. Writers bump a `watch`
//! counter so waiters wake promptly; waiters still re-check on a fixed
//! interval and honour their deadline exactly as a plain poll loop would.

use crate::protocol::OpState;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// How a wait on an operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// The event reached a state accepted by the predicate
    Reached(OpState),
    TimedOut,
    /// The caller's cancellation token fired
    Cancelled,
}

impl WaitResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, WaitResult::Reached(OpState::Complete))
    }
}

/// Event-name → latest payload map plus a short history
pub struct EventStateStore {
    states: RwLock<HashMap<String, Value>>,
    recent: Mutex<VecDeque<Value>>,
    ring_capacity: usize,
    live: broadcast::Sender<Value>,
    version: watch::Sender<u64>,
}

impl EventStateStore {
    pub fn new(ring_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        let (version, _) = watch::channel(0);
        Self {
            states: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity: ring_capacity.max(1),
            live,
            version,
        }
    }

    /// Record an inbound device event
    pub fn record_event(&self, name: &str, body: Value) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            recent.push_back(body.clone());
            while recent.len() > self.ring_capacity {
                recent.pop_front();
            }
        }
        let _ = self.live.send(body.clone());
        self.set(name, body);
    }

    /// Overwrite the entry for `name`
    pub fn set(&self, name: &str, value: Value) {
        self.write().insert(name.to_string(), value);
        self.bump();
    }

    /// Merge fields into the entry for `name`, creating it if absent
    pub fn update<F>(&self, name: &str, apply: F)
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        {
            let mut states = self.write();
            let entry = states
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(map) = entry {
                apply(map);
            }
        }
        self.bump();
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().get(name).cloned()
    }

    /// The `state` field of an entry, if both exist
    pub fn state_of(&self, name: &str) -> Option<OpState> {
        self.read()
            .get(name)
            .and_then(|v| v.get("state"))
            .and_then(Value::as_str)
            .map(OpState::parse)
    }

    /// Force an entry to `{"state": state}`
    ///
    /// Used before starting an operation so a stale terminal state from an
    /// earlier run is not mistaken for the outcome of this one.
    pub fn mark_op_state(&self, name: &str, state: OpState) {
        self.set(name, json!({ "state": state.as_str() }));
    }

    /// All entries as one JSON object
    pub fn snapshot(&self) -> Value {
        let states = self.read();
        let map: Map<String, Value> = states
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Most recent raw events, oldest first
    pub fn recent_events(&self) -> Vec<Value> {
        self.recent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Live feed of every inbound event
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.live.subscribe()
    }

    /// Change counter bumped on every write
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wait until the state of `name` satisfies `accept`
    ///
    /// `limit = None` waits indefinitely (still cancellable).
    pub async fn wait_until<F>(
        &self,
        name: &str,
        accept: F,
        poll_interval: Duration,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WaitResult
    where
        F: Fn(&OpState) -> bool,
    {
        let mut changes = self.changes();
        let start = Instant::now();

        loop {
            if let Some(state) = self.state_of(name) {
                if accept(&state) {
                    return WaitResult::Reached(state);
                }
            }
            if cancel.is_cancelled() {
                return WaitResult::Cancelled;
            }

            let mut wait = poll_interval;
            if let Some(limit) = limit {
                let elapsed = start.elapsed();
                if elapsed >= limit {
                    return WaitResult::TimedOut;
                }
                wait = wait.min(limit - elapsed);
            }

            tokio::select! {
                _ = cancel.cancelled() => return WaitResult::Cancelled,
                _ = timeout(wait, changes.changed()) => {}
            }
        }
    }

    /// Wait for `name` to reach a terminal state (complete, fail, cancel or stopped)
    pub async fn wait_end_op(
        &self,
        name: &str,
        poll_interval: Duration,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WaitResult {
        self.wait_until(name, OpState::is_terminal, poll_interval, limit, cancel)
            .await
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.states.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.states.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for EventStateStore {
    fn default() -> Self {
        Self::new(crate::EVENT_HISTORY_CAPACITY)
    }
}
