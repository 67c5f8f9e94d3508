//! Seestar Scheduler
//!
//! Runs an ordered list of imaging work on one telescope, and fans a shared
//! schedule out across several telescopes.
//!
//! ## Features
//!
//! - Typed schedule items: mosaic, spectra, auto focus, focus nudges, waits,
//!   start-up sequence, dew heater, exposure, shutdown and raw device commands
//! - Worker task with stop, pause/continue and skip-current-item
//! - Mid-run edits that never touch items already executed
//! - JSON export/import of schedules
//! - Federation: duplicate, split-by-time and split-by-panel mosaics

pub mod error;
pub mod federation;
pub mod item;
pub mod schedule;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use federation::{Federation, FederationSchedule, FederationStartRequest};
pub use item::{FederationMode, MosaicItem, ScheduleAction, ScheduleItem};
pub use schedule::{Schedule, ScheduleState};
pub use scheduler::{DeviceScheduler, SchedulerEvent, StartRequest};

/// Schedule format version written on export
pub const SCHEDULE_VERSION: &str = "1.0";
