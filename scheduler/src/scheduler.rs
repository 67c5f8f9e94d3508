//! Schedule execution for one telescope
//!
//! A [`DeviceScheduler`] owns one [`Schedule`]. Starting it spawns a worker
//! task that runs the items in order; stop, pause and skip requests reach the
//! running operation through the shared [`OperationContext`]. Every state
//! change is mirrored into the session's event store under `scheduler`.

use crate::error::{SchedulerError, SchedulerResult};
use crate::item::{ScheduleAction, ScheduleItem};
use crate::schedule::{Schedule, ScheduleState};
use chrono::{Local, NaiveTime, Timelike};
use seestar_device::protocol::{events, methods, response_failed, sounds};
use seestar_device::{
    CommandResult, ItemProgress, OperationContext, OperationOutcome, SeestarSession,
    StartupParams,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll step of `wait_for` and `wait_until`
const WAIT_STEP: Duration = Duration::from_secs(5);

/// Delay between the end of the run and a requested shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

pub(crate) const ACTIVE_MESSAGE: &str = "An existing scheduler is active. Returned with no action.";

/// Options of `start_scheduler`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Only start if this matches the current schedule
    #[serde(default)]
    pub schedule_id: Option<String>,
    /// 1-based item to start from
    #[serde(default)]
    pub start_item: Option<usize>,
}

/// Event emitted by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    StateChanged(ScheduleState),
    ItemStarted {
        id: String,
        number: usize,
        action: String,
    },
    ItemFinished {
        id: String,
        outcome: OperationOutcome,
    },
    RunFinished(ScheduleState),
}

/// How one item ended, as seen by the worker loop
enum ItemEnd {
    Done(OperationOutcome),
    Shutdown,
}

/// Scheduler of one Seestar
pub struct DeviceScheduler {
    session: Arc<SeestarSession>,
    schedule: RwLock<Schedule>,
    stop: Mutex<CancellationToken>,
    skip: Arc<AtomicBool>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn json_result(command: &str, code: i32, result: impl Into<Value>) -> CommandResult {
    let result = result.into();
    if code != 0 {
        warn!(
            "Returning not normal result for command {}, code: {}, result: {}",
            command, code, result
        );
    } else {
        debug!("Returning result for command {}: {}", command, result);
    }
    CommandResult::new(command, code, result)
}

fn item_record(kind: &str, item_id: &str, action: impl Into<String>) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("type".into(), json!(kind));
    record.insert("schedule_item_id".into(), json!(item_id));
    record.insert("action".into(), json!(action.into()));
    record
}

impl DeviceScheduler {
    pub fn new(session: Arc<SeestarSession>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let scheduler = Arc::new(Self {
            session,
            schedule: RwLock::new(Schedule::new(None)),
            stop: Mutex::new(CancellationToken::new()),
            skip: Arc::new(AtomicBool::new(false)),
            event_tx,
            worker: Mutex::new(None),
        });
        scheduler.publish();
        scheduler
    }

    pub fn session(&self) -> &Arc<SeestarSession> {
        &self.session
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Schedule> {
        self.schedule.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Schedule> {
        self.schedule.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> ScheduleState {
        self.read().state
    }

    fn set_state(&self, state: ScheduleState) {
        self.write().state = state;
        self.publish();
        let _ = self.event_tx.send(SchedulerEvent::StateChanged(state));
    }

    /// Snapshot with live stacking and skip flags
    pub fn get_schedule(&self) -> Schedule {
        let mut schedule = self.read().clone();
        schedule.is_stacking = self.session.is_stacking();
        schedule.is_skip_requested = self.skip.load(Ordering::SeqCst);
        schedule
    }

    /// The schedule, or `None` if `schedule_id` names a different one
    pub fn get_schedule_matching(&self, schedule_id: Option<&str>) -> Option<Schedule> {
        let schedule = self.get_schedule();
        match schedule_id {
            Some(id) if id != schedule.schedule_id => None,
            _ => Some(schedule),
        }
    }

    fn schedule_value(&self) -> Value {
        serde_json::to_value(self.get_schedule()).unwrap_or_default()
    }

    fn is_worker_busy(worker: &Option<JoinHandle<()>>) -> bool {
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Mirror the run state into the event store's `scheduler` entry
    fn publish(&self) {
        let schedule = self.get_schedule();
        self.session.events().update(events::SCHEDULER, |entry| {
            entry.insert("state".into(), json!(schedule.state));
            entry.insert("schedule_id".into(), json!(schedule.schedule_id));
            entry.insert("item_number".into(), json!(schedule.item_number));
            entry.insert("current_item_id".into(), json!(schedule.current_item_id));
            entry.insert(
                "is_stacking_paused".into(),
                json!(schedule.is_stacking_paused),
            );
            entry.insert(
                "is_skip_requested".into(),
                json!(schedule.is_skip_requested),
            );
        });
    }

    // =========================================================================
    // Editing
    // =========================================================================

    /// Reset to an empty, stopped schedule; refused while running
    pub fn create_schedule(&self, schedule_id: Option<String>) -> Schedule {
        {
            let mut schedule = self.write();
            if schedule.state.is_running() {
                warn!("[{}] Scheduler is still active", self.name());
                drop(schedule);
                return self.get_schedule();
            }
            *schedule = Schedule::new(schedule_id);
        }
        self.skip.store(false, Ordering::SeqCst);
        self.publish();
        self.get_schedule()
    }

    /// Build an item from a `{action, params}` request
    ///
    /// A mosaic at RA `-1` is pinned to the mount's current position.
    pub fn construct_schedule_item(&self, request: &Value) -> SchedulerResult<ScheduleItem> {
        let mut item = ScheduleItem::from_request(request)?;
        item.normalize_target(Some(self.session.current_position()));
        Ok(item)
    }

    /// Append an item; allowed at any time
    pub fn add_schedule_item(&self, request: &Value) -> SchedulerResult<Schedule> {
        let item = self.construct_schedule_item(request)?;
        self.write().list.push(item);
        Ok(self.get_schedule())
    }

    /// Append already-built items under fresh ids
    pub fn add_items(&self, items: &[ScheduleItem]) -> Schedule {
        self.write()
            .list
            .extend(items.iter().map(ScheduleItem::with_fresh_id));
        self.get_schedule()
    }

    pub fn insert_schedule_item_before(
        &self,
        before_id: &str,
        request: &Value,
    ) -> SchedulerResult<Schedule> {
        let item = self.construct_schedule_item(request)?;
        {
            let mut schedule = self.write();
            if schedule.is_locked(before_id) {
                warn!(
                    "[{}] Cannot insert schedule item that has already been executed",
                    self.name()
                );
                drop(schedule);
                return Ok(self.get_schedule());
            }
            let index = schedule
                .position_of(before_id)
                .ok_or_else(|| SchedulerError::ItemNotFound(before_id.to_string()))?;
            schedule.list.insert(index, item);
        }
        Ok(self.get_schedule())
    }

    pub fn replace_schedule_item(&self, item_id: &str, request: &Value) -> SchedulerResult<Schedule> {
        let item = self.construct_schedule_item(request)?;
        {
            let mut schedule = self.write();
            if schedule.is_locked(item_id) {
                warn!(
                    "[{}] Cannot replace schedule item that has already been executed",
                    self.name()
                );
                drop(schedule);
                return Ok(self.get_schedule());
            }
            let index = schedule
                .position_of(item_id)
                .ok_or_else(|| SchedulerError::ItemNotFound(item_id.to_string()))?;
            schedule.list[index] = item;
        }
        Ok(self.get_schedule())
    }

    pub fn remove_schedule_item(&self, item_id: &str) -> SchedulerResult<Schedule> {
        {
            let mut schedule = self.write();
            if schedule.is_locked(item_id) {
                warn!(
                    "[{}] Cannot remove schedule item that has already been executed",
                    self.name()
                );
                drop(schedule);
                return Ok(self.get_schedule());
            }
            let index = schedule
                .position_of(item_id)
                .ok_or_else(|| SchedulerError::ItemNotFound(item_id.to_string()))?;
            schedule.list.remove(index);
        }
        Ok(self.get_schedule())
    }

    pub fn export_schedule(&self, path: impl AsRef<Path>) -> SchedulerResult<Schedule> {
        let schedule = self.get_schedule();
        schedule.save(path)?;
        Ok(schedule)
    }

    /// Replace the schedule with a file's; refused while active
    ///
    /// Without `is_retain_state` the schedule and every item get new ids.
    pub fn import_schedule(
        &self,
        path: impl AsRef<Path>,
        is_retain_state: bool,
    ) -> SchedulerResult<CommandResult> {
        if !self.state().is_idle() {
            return Ok(json_result("import_schedule", -1, ACTIVE_MESSAGE));
        }
        let loaded = Schedule::load(path, is_retain_state)?;
        *self.write() = loaded;
        self.skip.store(false, Ordering::SeqCst);
        self.publish();
        Ok(json_result("import_schedule", 0, self.schedule_value()))
    }

    // =========================================================================
    // Shortcuts
    // =========================================================================

    /// New one-item schedule holding a mosaic, started at once
    pub fn start_mosaic(self: &Arc<Self>, params: &Value) -> SchedulerResult<CommandResult> {
        self.start_single("start_mosaic", params)
    }

    /// New one-item schedule holding a spectra capture, started at once
    pub fn start_spectra(self: &Arc<Self>, params: &Value) -> SchedulerResult<CommandResult> {
        self.start_single("start_spectra", params)
    }

    fn start_single(self: &Arc<Self>, action: &str, params: &Value) -> SchedulerResult<CommandResult> {
        if !self.state().is_idle() {
            return Ok(json_result(action, -1, ACTIVE_MESSAGE));
        }
        let item = self.construct_schedule_item(&json!({"action": action, "params": params}))?;
        let schedule_id = params
            .get("schedule_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.create_schedule(schedule_id.clone());
        self.write().list.push(item);
        Ok(self.start_scheduler(StartRequest {
            schedule_id,
            start_item: None,
        }))
    }

    // =========================================================================
    // Run control
    // =========================================================================

    pub fn start_scheduler(self: &Arc<Self>, request: StartRequest) -> CommandResult {
        let schedule_id = self.read().schedule_id.clone();
        if let Some(requested) = &request.schedule_id {
            if *requested != schedule_id {
                return json_result(
                    "start_scheduler",
                    0,
                    format!(
                        "Schedule with id {} did not match this device's schedule. Returned with no action.",
                        requested
                    ),
                );
            }
        }
        if !self.session.is_client_master() {
            return json_result(
                "start_scheduler",
                -1,
                "This device cannot be controlled. Grab the control first.",
            );
        }

        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if Self::is_worker_busy(&worker) || !self.state().is_idle() {
            return json_result("start_scheduler", -1, ACTIVE_MESSAGE);
        }

        let token = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        self.skip.store(false, Ordering::SeqCst);
        {
            let mut schedule = self.write();
            schedule.item_number = request.start_item.unwrap_or(1).max(1);
            schedule.current_item_id.clear();
            schedule.is_stacking_paused = false;
            schedule.is_skip_requested = false;
        }
        self.set_state(ScheduleState::Working);

        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { this.run_worker(token).await }));
        drop(worker);

        json_result("start_scheduler", 0, self.schedule_value())
    }

    /// Stop a running schedule
    ///
    /// Codes: 0 stopped, -3 already stopped, -4 already complete, -5 any
    /// other state. Only a running schedule changes state.
    pub async fn stop_scheduler(&self, schedule_id: Option<&str>) -> CommandResult {
        if let Some(requested) = schedule_id {
            if requested != self.read().schedule_id {
                return json_result(
                    "stop_scheduler",
                    0,
                    format!(
                        "Schedule with id {} did not match this device's schedule. Returned with no action.",
                        requested
                    ),
                );
            }
        }

        match self.state() {
            ScheduleState::Working | ScheduleState::Paused => {
                info!("[{}] Stopping scheduler", self.name());
                self.set_state(ScheduleState::Stopping);
                self.stop.lock().unwrap_or_else(|p| p.into_inner()).cancel();
                self.session.stop_goto_target().await;
                self.session.stop_stack().await;
                self.session.play_sound(sounds::SCHEDULE_STOP).await;
                // A new run may have started while the device calls were pending.
                let landed = {
                    let mut schedule = self.write();
                    if schedule.state == ScheduleState::Stopping {
                        schedule.state = ScheduleState::Stopped;
                        schedule.is_stacking_paused = false;
                        true
                    } else {
                        false
                    }
                };
                if landed {
                    self.publish();
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::StateChanged(ScheduleState::Stopped));
                }
                json_result("stop_scheduler", 0, "Scheduler stopped successfully.")
            }
            ScheduleState::Complete => json_result(
                "stop_scheduler",
                -4,
                "scheduler has already in complete state",
            ),
            ScheduleState::Stopped => json_result(
                "stop_scheduler",
                -3,
                "Scheduler is not running while trying to stop!",
            ),
            other => json_result(
                "stop_scheduler",
                -5,
                format!("scheduler is in unaccounted for state: {}", other),
            ),
        }
    }

    /// Stop stacking but keep the current item alive
    pub async fn pause_scheduler(&self) -> CommandResult {
        let can_pause = {
            let schedule = self.read();
            schedule.state == ScheduleState::Working
                && self.session.is_stacking()
                && !schedule.is_stacking_paused
        };
        if !can_pause {
            warn!("[{}] Scheduler is not stacking, so nothing to pause", self.name());
            return json_result("pause_scheduler", -1, "Scheduler is not stacking.");
        }

        info!("[{}] Pausing scheduler stacking", self.name());
        self.write().is_stacking_paused = true;
        self.set_state(ScheduleState::Paused);
        if self.session.stop_stack().await {
            json_result("pause_scheduler", 0, "Stacking paused.")
        } else {
            self.write().is_stacking_paused = false;
            self.set_state(ScheduleState::Working);
            json_result("pause_scheduler", -1, "Failed to pause stacking.")
        }
    }

    /// Resume stacking after [`pause_scheduler`](Self::pause_scheduler)
    pub async fn continue_scheduler(&self) -> CommandResult {
        let paused = {
            let schedule = self.read();
            schedule.state == ScheduleState::Paused && schedule.is_stacking_paused
        };
        if !paused {
            warn!("[{}] Scheduler was not paused, so nothing to do", self.name());
            return json_result(
                "continue_scheduler",
                -1,
                "Scheduler was not paused stacking.",
            );
        }

        let gain = self.session.imaging_config().gain;
        if self.session.start_stack(gain, false).await {
            self.write().is_stacking_paused = false;
            self.set_state(ScheduleState::Working);
            json_result("continue_scheduler", 0, "")
        } else {
            json_result("continue_scheduler", -1, "Failed to continue stacking.")
        }
    }

    /// Ask the running item to end early; the schedule moves on
    pub fn skip_scheduler_cur_item(&self) -> CommandResult {
        let item_number = {
            let mut schedule = self.write();
            if !schedule.state.is_running() || self.skip.load(Ordering::SeqCst) {
                drop(schedule);
                return json_result(
                    "skip_scheduler_cur_item",
                    -1,
                    "scheduler is not working or skip was already requested, so nothing to skip",
                );
            }
            self.skip.store(true, Ordering::SeqCst);
            schedule.is_skip_requested = true;
            schedule.is_stacking_paused = false;
            schedule.item_number
        };
        info!("[{}] Skipping schedule item {}", self.name(), item_number);
        if self.state() == ScheduleState::Paused {
            self.set_state(ScheduleState::Working);
        } else {
            self.publish();
        }
        json_result(
            "skip_scheduler_cur_item",
            0,
            "Requested to skip current item.",
        )
    }

    /// Run the start-up sequence outside any schedule
    ///
    /// The schedule reports `working` for the duration and can be stopped
    /// with [`stop_scheduler`](Self::stop_scheduler).
    pub async fn action_start_up_sequence(self: &Arc<Self>, params: StartupParams) -> CommandResult {
        if !self.state().is_idle() {
            return json_result("start_up_sequence", -1, "Device is busy. Try later.");
        }

        let response = self
            .session
            .send_command_sync(methods::SET_SETTING, Some(json!({"master_cli": true})))
            .await;
        info!("[{}] Set master_cli response: {}", self.name(), response);
        if !self.session.is_client_master() {
            return json_result(
                "start_up_sequence",
                -1,
                "Need to be master client to start up sequence.",
            );
        }

        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if Self::is_worker_busy(&worker) || !self.state().is_idle() {
            return json_result("start_up_sequence", -1, "Device is busy. Try later.");
        }

        let token = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        {
            let mut schedule = self.write();
            schedule.item_number = 0;
            schedule.current_item_id.clear();
        }
        self.set_state(ScheduleState::Working);

        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            info!("[{}] Start-up sequence begins", this.name());
            this.session.play_sound(sounds::SCHEDULE_START).await;
            let ctx = this.operation_context(&token);
            let outcome = this.session.run_start_up_sequence(&params, &ctx).await;
            let final_state = if outcome == OperationOutcome::Completed {
                ScheduleState::Complete
            } else {
                warn!("[{}] Start-up sequence ended: {:?}", this.name(), outcome);
                ScheduleState::Stopped
            };
            if this.state().is_running() {
                this.set_state(final_state);
            }
            let sound = if final_state == ScheduleState::Complete {
                sounds::SCHEDULE_FINISH
            } else {
                sounds::SCHEDULE_STOP
            };
            this.session.play_sound(sound).await;
            let _ = this.event_tx.send(SchedulerEvent::RunFinished(this.state()));
        }));

        json_result("start_up_sequence", 0, "Sequence started.")
    }

    // =========================================================================
    // Worker
    // =========================================================================

    fn operation_context(&self, token: &CancellationToken) -> OperationContext {
        OperationContext::new(
            token.clone(),
            Arc::clone(&self.skip),
            ItemProgress::new(Arc::clone(self.session.events())),
        )
    }

    async fn run_worker(self: Arc<Self>, stop: CancellationToken) {
        let mut index = self.read().item_number.saturating_sub(1);
        info!(
            "[{}] Schedule started from item {}",
            self.name(),
            index + 1
        );
        self.session.play_sound(sounds::SCHEDULE_START).await;

        let mut issue_shutdown = false;
        let mut failed = false;
        loop {
            let (item, number) = {
                let mut schedule = self.write();
                if !schedule.state.is_running() {
                    break;
                }
                let Some(item) = schedule.list.get(index).cloned() else {
                    break;
                };
                schedule.current_item_id = item.id.clone();
                schedule.item_number = index + 1;
                (item, index + 1)
            };
            self.publish();
            info!(
                "[{}] Running item {} ({})",
                self.name(),
                number,
                item.action.name()
            );
            let _ = self.event_tx.send(SchedulerEvent::ItemStarted {
                id: item.id.clone(),
                number,
                action: item.action.name().to_string(),
            });

            let ctx = self.operation_context(&stop);
            let end = self.run_item(&item, &ctx).await;

            self.skip.store(false, Ordering::SeqCst);
            self.write().is_skip_requested = false;

            match end {
                ItemEnd::Shutdown => {
                    let _ = self.event_tx.send(SchedulerEvent::ItemFinished {
                        id: item.id.clone(),
                        outcome: OperationOutcome::Completed,
                    });
                    issue_shutdown = true;
                    self.set_state(ScheduleState::Stopped);
                    break;
                }
                ItemEnd::Done(outcome) => {
                    let _ = self.event_tx.send(SchedulerEvent::ItemFinished {
                        id: item.id.clone(),
                        outcome: outcome.clone(),
                    });
                    if let OperationOutcome::Failed(reason) = outcome {
                        warn!(
                            "[{}] Item {} failed, stopping the schedule: {}",
                            self.name(),
                            number,
                            reason
                        );
                        ctx.progress().action(reason);
                        failed = true;
                        if self.state().is_running() {
                            self.set_state(ScheduleState::Stopping);
                        }
                        break;
                    }
                }
            }
            index += 1;
        }

        self.finish_run(failed, issue_shutdown).await;
    }

    async fn finish_run(&self, failed: bool, issue_shutdown: bool) {
        let final_state = {
            let mut schedule = self.write();
            schedule.state = match schedule.state {
                ScheduleState::Working | ScheduleState::Paused => ScheduleState::Complete,
                ScheduleState::Stopping => ScheduleState::Stopped,
                other => other,
            };
            schedule.current_item_id.clear();
            schedule.item_number = 0;
            schedule.is_stacking_paused = false;
            schedule.is_skip_requested = false;
            schedule.state
        };
        self.publish();
        let _ = self.event_tx.send(SchedulerEvent::StateChanged(final_state));

        if final_state == ScheduleState::Complete
            && self.session.below_horizon_dec_offset() != 0.0
            && !self.session.set_below_horizon_dec_offset(0.0, 0.0).await
        {
            warn!("[{}] Failed to clear the below-horizon offset", self.name());
        }

        info!("[{}] Scheduler finished: {}", self.name(), final_state);
        // a stop request already played its own sound
        if failed {
            self.session.play_sound(sounds::SCHEDULE_STOP).await;
        } else if final_state == ScheduleState::Complete {
            self.session.play_sound(sounds::SCHEDULE_FINISH).await;
        }
        let _ = self.event_tx.send(SchedulerEvent::RunFinished(final_state));

        if issue_shutdown {
            info!(
                "[{}] Shutting down the device in {:?}",
                self.name(),
                SHUTDOWN_GRACE
            );
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            self.session
                .send_command_sync(methods::PI_SHUTDOWN, None)
                .await;
        }
    }

    async fn run_item(&self, item: &ScheduleItem, ctx: &OperationContext) -> ItemEnd {
        let progress = ctx.progress();
        let outcome = match &item.action {
            ScheduleAction::StartMosaic(mosaic) => {
                self.session
                    .run_mosaic(&mosaic.mosaic, &item.id, ctx)
                    .await
            }
            ScheduleAction::StartSpectra(spectra) => {
                self.session.run_spectra(spectra, &item.id, ctx).await
            }
            ScheduleAction::AutoFocus { try_count } => {
                progress.begin(item_record("auto_focus", &item.id, "auto focus"));
                self.session.try_auto_focus(*try_count, ctx).await
            }
            ScheduleAction::AdjustFocus { steps } => {
                progress.begin(item_record("adjust_focus", &item.id, "adjust focus"));
                let response = self.session.adjust_focus(*steps).await;
                self.command_outcome("adjust_focus", &response)
            }
            ScheduleAction::Shutdown => {
                progress.begin(item_record("shut_down", &item.id, "shut down"));
                return ItemEnd::Shutdown;
            }
            ScheduleAction::WaitFor { timer_sec } => self.wait_for(*timer_sec, &item.id, ctx).await,
            ScheduleAction::WaitUntil { local_time } => {
                self.wait_until(*local_time, &item.id, ctx).await
            }
            ScheduleAction::StartUpSequence(params) => {
                self.session.run_start_up_sequence(params, ctx).await
            }
            ScheduleAction::SetDewHeater { heater } => {
                info!("[{}] Setting dew heater to {}", self.name(), heater);
                let response = self.session.action_set_dew_heater(*heater).await;
                self.command_outcome("action_set_dew_heater", &response)
            }
            ScheduleAction::SetExposure { exp } => {
                info!("[{}] Setting exposure to {} ms", self.name(), exp);
                let response = self.session.action_set_exposure(*exp).await;
                self.command_outcome("action_set_exposure", &response)
            }
            ScheduleAction::Passthrough { method, params } => {
                progress.begin(item_record(method, &item.id, method.as_str()));
                let response = self
                    .session
                    .send_command_sync(method, params.clone())
                    .await;
                self.command_outcome(method, &response)
            }
        };
        ItemEnd::Done(outcome)
    }

    /// Single-command items never stop the schedule; failures are logged
    fn command_outcome(&self, what: &str, response: &Value) -> OperationOutcome {
        if response_failed(response) {
            warn!("[{}] {} failed: {}", self.name(), what, response);
        }
        OperationOutcome::Completed
    }

    async fn wait_for(&self, timer_sec: u64, item_id: &str, ctx: &OperationContext) -> OperationOutcome {
        let progress = ctx.progress();
        let mut record = item_record("wait_for", item_id, format!("wait for {} seconds", timer_sec));
        record.insert("remaining s".into(), json!(timer_sec));
        progress.begin(record);

        let mut left = timer_sec;
        while left > 0 {
            if ctx.is_skip_requested() {
                info!("[{}] Requested to skip. Stopping wait_for.", self.name());
                return OperationOutcome::Skipped;
            }
            let step = left.min(WAIT_STEP.as_secs());
            if !ctx.sleep(Duration::from_secs(step)).await {
                return OperationOutcome::Stopped;
            }
            left -= step;
            progress.set("remaining s", left);
        }
        OperationOutcome::Completed
    }

    async fn wait_until(
        &self,
        local_time: NaiveTime,
        item_id: &str,
        ctx: &OperationContext,
    ) -> OperationOutcome {
        let progress = ctx.progress();
        progress.begin(item_record(
            "wait_until",
            item_id,
            format!("wait until local time of {}", local_time.format("%H:%M")),
        ));

        loop {
            let now = Local::now();
            progress.set(
                "current time",
                format!("{:02}:{:02}", now.hour(), now.minute()),
            );
            if now.hour() == local_time.hour() && now.minute() == local_time.minute() {
                return OperationOutcome::Completed;
            }
            if ctx.is_skip_requested() {
                info!("[{}] Requested to skip. Stopping wait_until.", self.name());
                return OperationOutcome::Skipped;
            }
            if !ctx.sleep(WAIT_STEP).await {
                return OperationOutcome::Stopped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seestar_device::testing::{test_config, MockSeestar};
    use seestar_device::{DeviceConfig, SeestarConfig};

    fn offline_scheduler() -> Arc<DeviceScheduler> {
        let session = SeestarSession::new(DeviceConfig::default(), &SeestarConfig::default());
        DeviceScheduler::new(session)
    }

    async fn connected_scheduler(mock: &MockSeestar) -> Arc<DeviceScheduler> {
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);
        DeviceScheduler::new(session)
    }

    async fn wait_for_state(scheduler: &DeviceScheduler, state: ScheduleState, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if scheduler.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn wait_item(secs: u64) -> Value {
        json!({"action": "wait_for", "params": {"timer_sec": secs}})
    }

    #[tokio::test]
    async fn test_wait_for_schedule_runs_to_complete() {
        let mock = MockSeestar::start().await;
        let scheduler = connected_scheduler(&mock).await;

        let schedule = scheduler.create_schedule(None);
        assert_eq!(schedule.state, ScheduleState::Stopped);
        assert!(schedule.list.is_empty());

        let schedule = scheduler.add_schedule_item(&wait_item(2)).unwrap();
        assert_eq!(schedule.list.len(), 1);

        let started = scheduler.start_scheduler(StartRequest::default());
        assert!(started.is_ok());
        assert_eq!(started.result["state"], "working");
        assert_eq!(scheduler.state(), ScheduleState::Working);

        assert!(wait_for_state(&scheduler, ScheduleState::Complete, Duration::from_secs(15)).await);
        let schedule = scheduler.get_schedule();
        assert!(schedule.current_item_id.is_empty());
        assert_eq!(schedule.item_number, 0);

        let sounds: Vec<Value> = mock
            .commands("play_sound")
            .into_iter()
            .map(|c| c["params"]["num"].clone())
            .collect();
        assert_eq!(sounds.first(), Some(&json!(80)));

        let mirrored = scheduler.session().events().get(events::SCHEDULER).unwrap();
        assert_eq!(mirrored["state"], "complete");
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_create_refused_while_working() {
        let scheduler = offline_scheduler();
        scheduler.add_schedule_item(&wait_item(5)).unwrap();
        scheduler.write().state = ScheduleState::Working;

        let before = scheduler.get_schedule();
        let after = scheduler.create_schedule(Some("other".into()));
        assert_eq!(after.schedule_id, before.schedule_id);
        assert_eq!(after.list.len(), 1);
    }

    #[tokio::test]
    async fn test_edits_guard_executed_items() {
        let scheduler = offline_scheduler();
        for secs in [1, 2, 3] {
            scheduler.add_schedule_item(&wait_item(secs)).unwrap();
        }
        let ids: Vec<String> = scheduler.get_schedule().list.iter().map(|i| i.id.clone()).collect();
        {
            let mut schedule = scheduler.write();
            schedule.state = ScheduleState::Working;
            schedule.current_item_id = ids[1].clone();
        }

        let unchanged = scheduler.remove_schedule_item(&ids[0]).unwrap();
        assert_eq!(unchanged.list.len(), 3);
        let unchanged = scheduler.remove_schedule_item(&ids[1]).unwrap();
        assert_eq!(unchanged.list.len(), 3);
        let unchanged = scheduler
            .insert_schedule_item_before(&ids[1], &wait_item(9))
            .unwrap();
        assert_eq!(unchanged.list.len(), 3);
        let unchanged = scheduler.replace_schedule_item(&ids[0], &wait_item(9)).unwrap();
        assert_eq!(unchanged.list[0].id, ids[0]);

        let removed = scheduler.remove_schedule_item(&ids[2]).unwrap();
        assert_eq!(removed.list.len(), 2);

        let inserted = scheduler.add_schedule_item(&wait_item(4)).unwrap();
        let last = inserted.list[2].id.clone();
        let inserted = scheduler
            .insert_schedule_item_before(&last, &wait_item(7))
            .unwrap();
        assert_eq!(inserted.list.len(), 4);
        assert_eq!(
            inserted.list[2].action,
            ScheduleAction::WaitFor { timer_sec: 7 }
        );
    }

    #[tokio::test]
    async fn test_edit_unknown_item_is_error() {
        let scheduler = offline_scheduler();
        let err = scheduler.remove_schedule_item("missing").unwrap_err();
        assert!(matches!(err, SchedulerError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_codes_by_state() {
        let scheduler = offline_scheduler();

        let result = scheduler.stop_scheduler(None).await;
        assert_eq!(result.code, -3);
        assert_eq!(scheduler.state(), ScheduleState::Stopped);

        scheduler.write().state = ScheduleState::Complete;
        let result = scheduler.stop_scheduler(None).await;
        assert_eq!(result.code, -4);
        assert_eq!(scheduler.state(), ScheduleState::Complete);

        scheduler.write().state = ScheduleState::Stopping;
        let result = scheduler.stop_scheduler(None).await;
        assert_eq!(result.code, -5);
        assert_eq!(scheduler.state(), ScheduleState::Stopping);

        let result = scheduler.stop_scheduler(Some("someone-else")).await;
        assert_eq!(result.code, 0);
        assert_eq!(scheduler.state(), ScheduleState::Stopping);
    }

    #[tokio::test]
    async fn test_stop_running_schedule() {
        let mock = MockSeestar::start().await;
        let scheduler = connected_scheduler(&mock).await;
        scheduler.add_schedule_item(&wait_item(60)).unwrap();
        scheduler.add_schedule_item(&json!({"action": "get_setting"})).unwrap();

        assert!(scheduler.start_scheduler(StartRequest::default()).is_ok());
        let second = scheduler.start_scheduler(StartRequest::default());
        assert_eq!(second.code, -1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = scheduler.stop_scheduler(None).await;
        assert_eq!(result.code, 0);
        assert_eq!(scheduler.state(), ScheduleState::Stopped);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.state(), ScheduleState::Stopped);
        assert_eq!(mock.count_method("get_setting"), 0);
        assert!(mock
            .commands("play_sound")
            .iter()
            .any(|c| c["params"]["num"] == 83));
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_slow_stop_does_not_clobber_new_run() {
        let mock = MockSeestar::start().await;
        mock.ignore_method("iscope_stop_view");
        let scheduler = connected_scheduler(&mock).await;
        scheduler.add_schedule_item(&wait_item(600)).unwrap();
        assert!(scheduler.start_scheduler(StartRequest::default()).is_ok());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopping = Arc::clone(&scheduler);
        let stop = tokio::spawn(async move { stopping.stop_scheduler(None).await });

        // The worker lands on stopped while stop_stack is still waiting.
        assert!(wait_for_state(&scheduler, ScheduleState::Stopped, Duration::from_secs(3)).await);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut restarted = false;
        while !restarted && tokio::time::Instant::now() < deadline {
            restarted = scheduler.start_scheduler(StartRequest::default()).is_ok();
            if !restarted {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        assert!(restarted);
        assert!(!stop.is_finished());

        assert_eq!(stop.await.unwrap().code, 0);
        assert_eq!(scheduler.state(), ScheduleState::Working);
        assert_eq!(scheduler.start_scheduler(StartRequest::default()).code, -1);
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_start_requires_master_and_matching_id() {
        let scheduler = offline_scheduler();
        scheduler.add_schedule_item(&wait_item(1)).unwrap();

        let mismatch = scheduler.start_scheduler(StartRequest {
            schedule_id: Some("not-this-one".into()),
            start_item: None,
        });
        assert_eq!(mismatch.code, 0);
        assert_eq!(scheduler.state(), ScheduleState::Stopped);

        scheduler
            .session()
            .handle_inbound_line(r#"{"Event":"Client","is_master":false}"#);
        let refused = scheduler.start_scheduler(StartRequest::default());
        assert_eq!(refused.code, -1);
        assert_eq!(scheduler.state(), ScheduleState::Stopped);
    }

    #[tokio::test]
    async fn test_skip_moves_to_next_item() {
        let mock = MockSeestar::start().await;
        let scheduler = connected_scheduler(&mock).await;
        scheduler.add_schedule_item(&wait_item(600)).unwrap();
        scheduler
            .add_schedule_item(&json!({"action": "get_setting"}))
            .unwrap();

        assert!(scheduler.start_scheduler(StartRequest::default()).is_ok());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(scheduler.skip_scheduler_cur_item().is_ok());
        assert_eq!(scheduler.skip_scheduler_cur_item().code, -1);

        assert!(wait_for_state(&scheduler, ScheduleState::Complete, Duration::from_secs(15)).await);
        assert_eq!(mock.count_method("get_setting"), 1);
        assert!(!scheduler.get_schedule().is_skip_requested);
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_failed_item_stops_schedule() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "start_auto_focuse",
            vec![json!({"Event": "AutoFocus", "state": "fail"})],
        );
        let scheduler = connected_scheduler(&mock).await;
        scheduler
            .add_schedule_item(&json!({"action": "auto_focus", "params": {"try_count": 1}}))
            .unwrap();
        scheduler
            .add_schedule_item(&json!({"action": "get_setting"}))
            .unwrap();

        assert!(scheduler.start_scheduler(StartRequest::default()).is_ok());
        assert!(wait_for_state(&scheduler, ScheduleState::Stopped, Duration::from_secs(20)).await);
        assert_eq!(mock.count_method("get_setting"), 0);
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_start_item_skips_earlier_items() {
        let mock = MockSeestar::start().await;
        let scheduler = connected_scheduler(&mock).await;
        scheduler.add_schedule_item(&wait_item(600)).unwrap();
        scheduler
            .add_schedule_item(&json!({"action": "get_setting", "params": {"key": "x"}}))
            .unwrap();

        let started = scheduler.start_scheduler(StartRequest {
            schedule_id: None,
            start_item: Some(2),
        });
        assert!(started.is_ok());
        assert!(wait_for_state(&scheduler, ScheduleState::Complete, Duration::from_secs(15)).await);
        assert_eq!(mock.commands("get_setting")[0]["params"], json!({"key": "x"}));
        scheduler.session().end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_pause_needs_stacking() {
        let scheduler = offline_scheduler();
        scheduler.write().state = ScheduleState::Working;
        assert_eq!(scheduler.pause_scheduler().await.code, -1);
        assert_eq!(scheduler.continue_scheduler().await.code, -1);
        assert_eq!(scheduler.state(), ScheduleState::Working);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night.json");

        let scheduler = offline_scheduler();
        scheduler.add_schedule_item(&wait_item(10)).unwrap();
        scheduler
            .add_schedule_item(&json!({"action": "auto_focus", "params": {"try_count": 2}}))
            .unwrap();
        let exported = scheduler.export_schedule(&path).unwrap();

        let other = offline_scheduler();
        let kept = other.import_schedule(&path, true).unwrap();
        assert!(kept.is_ok());
        let imported = other.get_schedule();
        assert_eq!(imported.schedule_id, exported.schedule_id);
        assert_eq!(imported.list, exported.list);

        let fresh = offline_scheduler();
        fresh.import_schedule(&path, false).unwrap();
        let imported = fresh.get_schedule();
        assert_ne!(imported.schedule_id, exported.schedule_id);
        for (new, old) in imported.list.iter().zip(&exported.list) {
            assert_ne!(new.id, old.id);
            assert_eq!(new.action, old.action);
        }
    }

    #[tokio::test]
    async fn test_import_refused_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night.json");
        let scheduler = offline_scheduler();
        scheduler.export_schedule(&path).unwrap();

        scheduler.write().state = ScheduleState::Working;
        let result = scheduler.import_schedule(&path, true).unwrap();
        assert_eq!(result.code, -1);
    }

    #[tokio::test]
    async fn test_start_up_refused_while_busy() {
        let scheduler = offline_scheduler();
        scheduler.write().state = ScheduleState::Working;
        let result = scheduler
            .action_start_up_sequence(StartupParams::default())
            .await;
        assert_eq!(result.code, -1);
        assert_eq!(result.result, "Device is busy. Try later.");
    }
}
