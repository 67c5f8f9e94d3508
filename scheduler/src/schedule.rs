//! The schedule document: items, run state and file round trips

use crate::error::{SchedulerError, SchedulerResult};
use crate::item::{new_item_id, ScheduleItem};
use crate::SCHEDULE_VERSION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Run state of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    #[default]
    Stopped,
    Working,
    Stopping,
    /// Stacking paused on request; the worker is still running
    Paused,
    Complete,
}

impl ScheduleState {
    /// A new run may start from this state
    pub fn is_idle(&self) -> bool {
        matches!(self, ScheduleState::Stopped | ScheduleState::Complete)
    }

    /// The worker owns the schedule
    pub fn is_running(&self) -> bool {
        matches!(self, ScheduleState::Working | ScheduleState::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Stopped => "stopped",
            ScheduleState::Working => "working",
            ScheduleState::Stopping => "stopping",
            ScheduleState::Paused => "paused",
            ScheduleState::Complete => "complete",
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_version() -> String {
    SCHEDULE_VERSION.to_string()
}

fn default_event() -> String {
    "Scheduler".to_string()
}

/// An ordered list of items plus the state of its run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "Event", default = "default_event")]
    pub event: String,
    pub schedule_id: String,
    #[serde(default)]
    pub list: Vec<ScheduleItem>,
    #[serde(default)]
    pub state: ScheduleState,
    #[serde(default)]
    pub is_stacking_paused: bool,
    #[serde(default)]
    pub is_stacking: bool,
    #[serde(default)]
    pub is_skip_requested: bool,
    /// Id of the item being executed, empty when idle
    #[serde(default)]
    pub current_item_id: String,
    /// 1-based position of the current item; 0 when idle
    #[serde(default)]
    pub item_number: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Schedule {
    /// Empty, stopped schedule; a fresh id unless one is given
    pub fn new(schedule_id: Option<String>) -> Self {
        Self {
            version: default_version(),
            event: default_event(),
            schedule_id: schedule_id.unwrap_or_else(new_item_id),
            list: Vec::new(),
            state: ScheduleState::Stopped,
            is_stacking_paused: false,
            is_stacking: false,
            is_skip_requested: false,
            current_item_id: String::new(),
            item_number: 0,
        }
    }

    pub fn position_of(&self, item_id: &str) -> Option<usize> {
        self.list.iter().position(|item| item.id == item_id)
    }

    /// Index of the item being executed
    pub fn current_index(&self) -> Option<usize> {
        if self.current_item_id.is_empty() {
            return None;
        }
        self.position_of(&self.current_item_id)
    }

    /// Whether `item_id` is at or before the current item of a running schedule
    ///
    /// While running with no known current item every item is locked.
    pub fn is_locked(&self, item_id: &str) -> bool {
        if !self.state.is_running() {
            return false;
        }
        match (self.position_of(item_id), self.current_index()) {
            (Some(target), Some(current)) => target <= current,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Clear run bookkeeping so the schedule can be started again
    pub fn reset_run_state(&mut self) {
        self.state = ScheduleState::Stopped;
        self.is_stacking_paused = false;
        self.is_stacking = false;
        self.is_skip_requested = false;
        self.current_item_id.clear();
    }

    /// New schedule id and new item ids; item content is unchanged
    pub fn regenerate_ids(&mut self) {
        self.schedule_id = new_item_id();
        for item in &mut self.list {
            *item = item.with_fresh_id();
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> SchedulerResult<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| SchedulerError::File {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a schedule file, normalising its header and run state
    ///
    /// `item_number` is set to 9999 so a start without `start_item` has to
    /// say where to begin; a plain start resets it to 1.
    pub fn load(path: impl AsRef<Path>, retain_ids: bool) -> SchedulerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchedulerError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let mut schedule: Schedule = serde_json::from_str(&text)?;
        schedule.version = default_version();
        schedule.event = default_event();
        schedule.reset_run_state();
        schedule.item_number = 9999;
        if !retain_ids {
            schedule.regenerate_ids();
        }
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ScheduleAction;

    fn wait(secs: u64) -> ScheduleItem {
        ScheduleItem::new(ScheduleAction::WaitFor { timer_sec: secs })
    }

    #[test]
    fn test_new_schedule_is_empty_and_stopped() {
        let schedule = Schedule::new(None);
        assert_eq!(schedule.state, ScheduleState::Stopped);
        assert!(schedule.list.is_empty());
        assert_eq!(schedule.version, "1.0");

        let named = Schedule::new(Some("night-1".to_string()));
        assert_eq!(named.schedule_id, "night-1");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let value = serde_json::to_value(ScheduleState::Complete).unwrap();
        assert_eq!(value, "complete");
        let schedule = serde_json::to_value(Schedule::new(None)).unwrap();
        assert_eq!(schedule["Event"], "Scheduler");
        assert_eq!(schedule["state"], "stopped");
    }

    #[test]
    fn test_lock_covers_current_and_earlier_items() {
        let mut schedule = Schedule::new(None);
        schedule.list = vec![wait(1), wait(2), wait(3)];
        let ids: Vec<String> = schedule.list.iter().map(|i| i.id.clone()).collect();

        assert!(!schedule.is_locked(&ids[0]));

        schedule.state = ScheduleState::Working;
        schedule.current_item_id = ids[1].clone();
        assert!(schedule.is_locked(&ids[0]));
        assert!(schedule.is_locked(&ids[1]));
        assert!(!schedule.is_locked(&ids[2]));
        assert!(!schedule.is_locked("not-there"));

        schedule.current_item_id.clear();
        assert!(schedule.is_locked(&ids[2]));
    }

    #[test]
    fn test_save_and_load_retaining_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");

        let mut schedule = Schedule::new(None);
        schedule.list = vec![wait(10), wait(20)];
        schedule.state = ScheduleState::Complete;
        schedule.save(&path).unwrap();

        let loaded = Schedule::load(&path, true).unwrap();
        assert_eq!(loaded.schedule_id, schedule.schedule_id);
        assert_eq!(loaded.list, schedule.list);
        assert_eq!(loaded.state, ScheduleState::Stopped);
        assert_eq!(loaded.item_number, 9999);
    }

    #[test]
    fn test_load_missing_file_is_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Schedule::load(dir.path().join("absent.json"), true).unwrap_err();
        assert!(matches!(err, SchedulerError::File { .. }));
    }
}
