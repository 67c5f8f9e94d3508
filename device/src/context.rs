//! Per-operation control handle
//!
//! High-level operations poll for a stop request, a skip request and publish
//! progress. The scheduler owns the token and flags; standalone callers use
//! [`OperationContext::detached`].

use crate::event_state::EventStateStore;
use crate::protocol::events;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a high-level operation finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    /// A stop request ended the operation early
    Stopped,
    /// A skip request ended the current item early
    Skipped,
}

impl OperationOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        OperationOutcome::Failed(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Completed | OperationOutcome::Skipped)
    }
}

/// Writes per-item telemetry into the `scheduler` entry of the event store
#[derive(Clone)]
pub struct ItemProgress {
    store: Option<Arc<EventStateStore>>,
}

impl ItemProgress {
    pub fn new(store: Arc<EventStateStore>) -> Self {
        Self { store: Some(store) }
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Replace the whole current-item record
    pub fn begin(&self, record: Map<String, Value>) {
        if let Some(store) = &self.store {
            store.update(events::SCHEDULER, |scheduler| {
                scheduler.insert("cur_scheduler_item".to_string(), Value::Object(record));
            });
        }
    }

    /// Set one field of the current-item record
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if let Some(store) = &self.store {
            store.update(events::SCHEDULER, |scheduler| {
                let item = scheduler
                    .entry("cur_scheduler_item".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !item.is_object() {
                    *item = Value::Object(Map::new());
                }
                if let Value::Object(map) = item {
                    map.insert(key.to_string(), value);
                }
            });
        }
    }

    /// Human-readable description of what the item is doing
    pub fn action(&self, message: impl Into<String>) {
        self.set("action", Value::String(message.into()));
    }

    pub fn current(&self) -> Option<Value> {
        self.store
            .as_ref()
            .and_then(|s| s.get(events::SCHEDULER))
            .and_then(|v| v.get("cur_scheduler_item").cloned())
    }
}

/// Stop/skip/progress handle passed to every high-level operation
#[derive(Clone)]
pub struct OperationContext {
    stop: CancellationToken,
    skip: Arc<AtomicBool>,
    progress: ItemProgress,
}

impl OperationContext {
    pub fn new(stop: CancellationToken, skip: Arc<AtomicBool>, progress: ItemProgress) -> Self {
        Self {
            stop,
            skip,
            progress,
        }
    }

    /// A context nobody else can stop or skip
    pub fn detached() -> Self {
        Self::new(
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
            ItemProgress::disabled(),
        )
    }

    pub fn token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_skip_requested(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn clear_skip(&self) {
        self.skip.store(false, Ordering::SeqCst);
    }

    pub fn progress(&self) -> &ItemProgress {
        &self.progress
    }

    /// Sleep unless stopped first; returns false if the stop request arrived
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_interrupted_by_stop() {
        let ctx = OperationContext::detached();
        let stopper = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.request_stop();
        });

        let started = Instant::now();
        assert!(!ctx.sleep(Duration::from_secs(30)).await);
        assert!(ctx.is_stopped());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_skip_flag_shared_between_clones() {
        let ctx = OperationContext::detached();
        let other = ctx.clone();
        other.request_skip();
        assert!(ctx.is_skip_requested());
        ctx.clear_skip();
        assert!(!other.is_skip_requested());
    }

    #[test]
    fn test_progress_writes_scheduler_entry() {
        let store = Arc::new(EventStateStore::new(20));
        let progress = ItemProgress::new(Arc::clone(&store));

        let mut record = Map::new();
        record.insert("type".into(), json!("mosaic"));
        progress.begin(record);
        progress.set("item_remaining_time_s", 120);
        progress.action("stacking the frames");

        let item = progress.current().unwrap();
        assert_eq!(item["type"], "mosaic");
        assert_eq!(item["item_remaining_time_s"], 120);
        assert_eq!(item["action"], "stacking the frames");
    }

    #[test]
    fn test_outcome_success() {
        assert!(OperationOutcome::Completed.is_success());
        assert!(OperationOutcome::Skipped.is_success());
        assert!(!OperationOutcome::Stopped.is_success());
        assert!(!OperationOutcome::failed("no star").is_success());
    }
}
