//! Per-device session context
//!
//! One [`SeestarSession`] per telescope. It owns the transport, the command id
//! counter, the response cache and the event state store, so several devices
//! in one process never share state.

use crate::callbacks::{BatteryWatch, CallbackAction, EventCallback, SensorTempWatch};
use crate::config::{
    DeviceConfig, ImagingConfig, ReconnectConfig, SeestarConfig, SessionTimeoutConfig, SiteConfig,
};
use crate::correlator::{CommandIds, ResponseCache};
use crate::event_state::EventStateStore;
use crate::ops::polar_align::corrected_pa_error;
use crate::protocol::{
    events, methods, response_failed, Command, CommandResult, InboundMessage, OpState,
    SYNC_TIMEOUT_RESULT,
};
use crate::transport::{ConnectionEvent, Transport};
use crate::watch::WatchTasks;
use crate::{EVENT_HISTORY_CAPACITY, FIRST_COMMAND_ID, RESPONSE_CACHE_CAPACITY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Firmware above which the device supports guest-mode control claims
pub const GUEST_MODE_MIN_FIRMWARE: i64 = 2300;

/// Sky position in the true (un-offset) frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SkyPosition {
    /// Hours
    pub ra: f64,
    /// Degrees
    pub dec: f64,
}

/// Plate-solve bookkeeping for a polar-alignment session
#[derive(Debug, Clone, Default)]
pub struct PolarAlignTracker {
    pub in_session: bool,
    pub auto_retry: bool,
    /// First solve of the session
    pub reference: Option<SkyPosition>,
    /// Latest successful solve
    pub current: Option<SkyPosition>,
    pub solve_failed: bool,
}

/// Remote-control session for one Seestar
pub struct SeestarSession {
    pub(crate) name: String,
    pub(crate) device: DeviceConfig,
    pub(crate) site: RwLock<SiteConfig>,
    pub(crate) imaging: ImagingConfig,
    pub(crate) timeouts: SessionTimeoutConfig,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) transport: Transport,
    ids: CommandIds,
    responses: ResponseCache,
    events: Arc<EventStateStore>,
    position: RwLock<SkyPosition>,
    below_horizon_dec_offset: RwLock<f64>,
    firmware_ver_int: AtomicI64,
    pub(crate) custom_goto_state: RwLock<OpState>,
    /// Stop signal for a running auto-center loop
    pub(crate) goto_control: Mutex<Option<CancellationToken>>,
    pub(crate) polar: Mutex<PolarAlignTracker>,
    /// Raw (x, y) polar-alignment error from the last `EqModePA` completion
    pa_error: Mutex<Option<(f64, f64)>>,
    view_state: RwLock<Value>,
    is_stacking: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn EventCallback>>>,
    pub(crate) watch_tasks: tokio::sync::Mutex<Option<WatchTasks>>,
    pub(crate) solve_retry_delay: Duration,
}

impl SeestarSession {
    /// Create a session for `device` using the shared settings in `config`
    pub fn new(device: DeviceConfig, config: &SeestarConfig) -> Arc<Self> {
        let transport = Transport::new(
            &device.name,
            &device.ip_address,
            device.port,
            &config.timeouts,
            &config.reconnect,
        );
        Arc::new(Self {
            name: device.name.clone(),
            device,
            site: RwLock::new(config.site.clone()),
            imaging: config.imaging.clone(),
            timeouts: config.timeouts.clone(),
            reconnect: config.reconnect.clone(),
            transport,
            ids: CommandIds::starting_at(FIRST_COMMAND_ID),
            responses: ResponseCache::new(RESPONSE_CACHE_CAPACITY),
            events: Arc::new(EventStateStore::new(EVENT_HISTORY_CAPACITY)),
            position: RwLock::new(SkyPosition::default()),
            below_horizon_dec_offset: RwLock::new(0.0),
            firmware_ver_int: AtomicI64::new(0),
            custom_goto_state: RwLock::new(OpState::Stopped),
            goto_control: Mutex::new(None),
            polar: Mutex::new(PolarAlignTracker::default()),
            pa_error: Mutex::new(None),
            view_state: RwLock::new(Value::Null),
            is_stacking: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            watch_tasks: tokio::sync::Mutex::new(None),
            solve_retry_delay: Duration::from_secs(2),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn device_num(&self) -> u32 {
        self.device.device_num
    }

    pub fn is_eq_mode(&self) -> bool {
        self.device.is_eq_mode
    }

    pub fn imaging_config(&self) -> &ImagingConfig {
        &self.imaging
    }

    pub fn timeouts(&self) -> &SessionTimeoutConfig {
        &self.timeouts
    }

    pub fn site(&self) -> SiteConfig {
        read_lock(&self.site).clone()
    }

    /// Update the site used for horizon math and `set_user_location`
    pub fn set_site_location(&self, latitude: f64, longitude: f64) {
        let mut site = write_lock(&self.site);
        site.latitude = latitude;
        site.longitude = longitude;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.transport.subscribe()
    }

    pub fn events(&self) -> &Arc<EventStateStore> {
        &self.events
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    pub fn next_command_id(&self) -> u64 {
        self.ids.peek()
    }

    pub fn firmware_ver_int(&self) -> i64 {
        self.firmware_ver_int.load(Ordering::SeqCst)
    }

    pub fn set_firmware_ver_int(&self, version: i64) {
        self.firmware_ver_int.store(version, Ordering::SeqCst);
    }

    /// Last known true RA/Dec
    pub fn current_position(&self) -> SkyPosition {
        *read_lock(&self.position)
    }

    pub fn below_horizon_dec_offset(&self) -> f64 {
        *read_lock(&self.below_horizon_dec_offset)
    }

    pub(crate) fn store_below_horizon_dec_offset(&self, offset: f64) {
        *write_lock(&self.below_horizon_dec_offset) = offset;
    }

    pub fn custom_goto_state(&self) -> OpState {
        read_lock(&self.custom_goto_state).clone()
    }

    pub(crate) fn set_custom_goto_state(&self, state: OpState) {
        debug!("[{}] custom goto state -> {}", self.name, state);
        *write_lock(&self.custom_goto_state) = state;
    }

    /// Last `get_view_state` result
    pub fn view_state(&self) -> Value {
        read_lock(&self.view_state).clone()
    }

    pub fn is_stacking(&self) -> bool {
        self.is_stacking.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stacking(&self, stacking: bool) {
        self.is_stacking.store(stacking, Ordering::SeqCst);
    }

    pub fn polar_align_tracker(&self) -> PolarAlignTracker {
        self.polar.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Raw (x, y) error of the last completed 3-point polar alignment
    pub fn pa_error_raw(&self) -> Option<(f64, f64)> {
        *self.pa_error.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_event_callback(&self, callback: Box<dyn EventCallback>) {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    /// Mark an operation's event state, e.g. before starting it
    pub fn mark_op_state(&self, event_name: &str, state: OpState) {
        self.events.mark_op_state(event_name, state);
    }

    /// Whether this client holds device master control; unknown counts as yes
    pub fn is_client_master(&self) -> bool {
        self.events
            .get(events::CLIENT)
            .and_then(|client| client.get("is_master").and_then(Value::as_bool))
            .unwrap_or(true)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a command without waiting; returns its id
    pub async fn send_command(&self, method: &str, params: Option<Value>) -> u64 {
        let id = self.ids.next_id();
        let command = Command::new(id, method, params);
        match command.to_line() {
            Ok(line) => {
                debug!("[{}] -> {}", self.name, line);
                if !self.transport.send(&line).await {
                    warn!("[{}] Failed to send {} (id {})", self.name, method, id);
                }
            }
            Err(e) => warn!("[{}] Failed to encode {}: {}", self.name, method, e),
        }
        id
    }

    /// Send a `{method, params?}` object without waiting; returns its id
    ///
    /// The id is always assigned by the session; a caller-supplied `id` is replaced.
    pub async fn send_message_param(&self, data: &Value) -> u64 {
        let (method, params) = split_message(data);
        self.send_command(&method, params).await
    }

    /// Send and wait for the matching response
    ///
    /// Never fails: a missing response becomes a synthetic result carrying
    /// [`SYNC_TIMEOUT_RESULT`].
    pub(crate) async fn request(&self, method: &str, params: Option<Value>) -> Value {
        let id = self.send_command(method, params.clone()).await;
        let waited = self
            .responses
            .wait_for(
                id,
                method,
                self.timeouts.sync_poll_interval(),
                self.timeouts.slow_warning(),
                self.timeouts.sync_command_timeout(),
            )
            .await;

        match waited {
            Some(response) => response,
            None => {
                warn!(
                    "[{}] Failed to wait for message response. {:?} elapsed for {} (id {})",
                    self.name,
                    self.timeouts.sync_command_timeout(),
                    method,
                    id
                );
                let mut synthetic = json!({"id": id, "method": method});
                if let Some(params) = params {
                    synthetic["params"] = params;
                }
                synthetic["result"] = Value::String(SYNC_TIMEOUT_RESULT.to_string());
                synthetic
            }
        }
    }

    /// Send and wait for the response
    ///
    /// `pi_shutdown`/`pi_reboot` are handed to a detached task that parks the
    /// mount first; the call returns an acknowledgement immediately.
    pub async fn send_command_sync(self: &Arc<Self>, method: &str, params: Option<Value>) -> Value {
        if method == methods::PI_SHUTDOWN || method == methods::PI_REBOOT {
            return self.dispatch_power_command(method, params);
        }
        self.request(method, params).await
    }

    /// `send_command_sync` taking a `{method, params?}` object
    pub async fn send_message_param_sync(self: &Arc<Self>, data: &Value) -> Value {
        let (method, params) = split_message(data);
        self.send_command_sync(&method, params).await
    }

    /// Query the mount and return the refreshed true position
    pub async fn refresh_position(&self) -> Option<SkyPosition> {
        let response = self.request(methods::SCOPE_GET_EQU_COORD, None).await;
        if response_failed(&response) {
            return None;
        }
        Some(self.current_position())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle one complete inbound line; malformed lines are logged and dropped
    pub fn handle_inbound_line(self: &Arc<Self>, line: &str) {
        match InboundMessage::parse_line(line) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!("[{}] Dropping malformed line ({}): {}", self.name, e, line),
        }
    }

    pub fn handle_message(self: &Arc<Self>, message: InboundMessage) {
        match message {
            InboundMessage::Response { id, body } => {
                match body.get("method").and_then(Value::as_str) {
                    Some(methods::SCOPE_GET_EQU_COORD) => {
                        if let Some(result) = body.get("result") {
                            self.update_position_from_device(result);
                        }
                    }
                    Some(methods::GET_VIEW_STATE) => {
                        if let Some(result) = body.get("result") {
                            *write_lock(&self.view_state) = result.clone();
                        }
                    }
                    _ => {}
                }
                debug!("[{}] <- response {}", self.name, id);
                self.responses.insert(id, body);
            }
            InboundMessage::Event { name, body } => self.handle_event(&name, body),
            InboundMessage::Unknown(value) => {
                debug!("[{}] Ignoring unclassified message: {}", self.name, value)
            }
        }
    }

    fn update_position_from_device(&self, result: &Value) {
        let ra = result.get("ra").and_then(Value::as_f64);
        let dec = result.get("dec").and_then(Value::as_f64);
        if let (Some(ra), Some(dec)) = (ra, dec) {
            let offset = self.below_horizon_dec_offset();
            *write_lock(&self.position) = SkyPosition {
                ra,
                dec: dec - offset,
            };
        }
    }

    fn handle_event(self: &Arc<Self>, name: &str, body: Value) {
        if name == events::SIMU_STACK {
            self.handle_simulator_stack(&body);
            self.dispatch_callbacks(name, &body);
            return;
        }
        let state = body.get("state").and_then(Value::as_str).map(OpState::parse);

        match name {
            events::EQ_MODE_PA => match state {
                Some(OpState::Working) | Some(OpState::Fail) => {
                    *self.pa_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
                }
                Some(OpState::Complete) => {
                    let x = body.get("x").and_then(Value::as_f64);
                    let y = body.get("y").and_then(Value::as_f64);
                    if let (Some(x), Some(y)) = (x, y) {
                        *self.pa_error.lock().unwrap_or_else(|p| p.into_inner()) = Some((x, y));
                    }
                }
                _ => {}
            },
            events::PLATE_SOLVE => self.track_plate_solve(state.as_ref(), &body),
            _ => {}
        }

        self.events.record_event(name, body.clone());
        self.dispatch_callbacks(name, &body);
    }

    /// The simulator reports stacking on the control channel; only its
    /// stack counters are kept, under `Stack`
    fn handle_simulator_stack(&self, body: &Value) {
        if body.get("stack_status").is_none() {
            debug!("[{}] Simu_Stack without stack_status ignored", self.name);
            return;
        }
        let mut stack = Map::new();
        stack.insert("Event".into(), json!(events::STACK));
        for key in ["state", "stacked_frame", "dropped_frame"] {
            if let Some(value) = body.get(key) {
                stack.insert(key.into(), value.clone());
            }
        }
        self.events.set(events::STACK, Value::Object(stack));
    }

    fn track_plate_solve(self: &Arc<Self>, state: Option<&OpState>, body: &Value) {
        let mut retry = false;
        {
            let mut polar = self.polar.lock().unwrap_or_else(|p| p.into_inner());
            match state {
                Some(OpState::Complete) => {
                    let solved = body
                        .get("result")
                        .and_then(|r| r.get("ra_dec"))
                        .and_then(Value::as_array)
                        .and_then(|pair| Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?)));
                    if let Some((ra, dec)) = solved {
                        let position = SkyPosition {
                            ra,
                            dec: dec - self.below_horizon_dec_offset(),
                        };
                        polar.current = Some(position);
                        polar.solve_failed = false;
                        if polar.in_session && polar.reference.is_none() {
                            info!(
                                "[{}] Polar alignment reference set at RA {:.4} Dec {:.4}",
                                self.name, position.ra, position.dec
                            );
                            polar.reference = Some(position);
                        }
                    }
                    retry = polar.auto_retry;
                }
                Some(OpState::Fail) => {
                    polar.solve_failed = true;
                    retry = polar.auto_retry;
                }
                _ => {}
            }
        }

        if retry {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(session.solve_retry_delay).await;
                let still_looping = session
                    .polar
                    .lock()
                    .map(|p| p.auto_retry)
                    .unwrap_or(false);
                if still_looping {
                    session.send_command(methods::START_SOLVE, None).await;
                }
            });
        }
    }

    fn dispatch_callbacks(self: &Arc<Self>, name: &str, body: &Value) {
        let actions: Vec<CallbackAction> = {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            callbacks
                .iter_mut()
                .filter(|cb| cb.fire_on_events().iter().any(|e| *e == name))
                .flat_map(|cb| cb.event_fired(body))
                .collect()
        };

        for action in actions {
            match action {
                CallbackAction::Shutdown { reason } => {
                    warn!("[{}] Shutting down: {}", self.name, reason);
                    self.dispatch_power_command(methods::PI_SHUTDOWN, None);
                }
            }
        }
    }

    /// Read device state after a connect, claim guest mode and install callbacks
    pub(crate) async fn initialize_after_connect(self: &Arc<Self>) {
        let response = self.request(methods::GET_DEVICE_STATE, None).await;
        let state = response.get("result").cloned();

        if let Some(version) = state
            .as_ref()
            .and_then(|s| s.get("device"))
            .and_then(|d| d.get("firmware_ver_int"))
            .and_then(Value::as_i64)
        {
            self.set_firmware_ver_int(version);
            info!("[{}] Firmware version {}", self.name, version);
        }

        {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
            if callbacks.is_empty() {
                callbacks.push(Box::new(BatteryWatch::new(
                    self.imaging.battery_low_limit,
                    state.as_ref(),
                )));
                callbacks.push(Box::new(SensorTempWatch::new(6.0, state.as_ref())));
            }
        }

        if self.imaging.guest_mode_init && self.firmware_ver_int() > GUEST_MODE_MIN_FIRMWARE {
            info!("[{}] Claiming master control", self.name);
            self.request(methods::SET_SETTING, Some(json!({"master_cli": true})))
                .await;
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "seestar-controller".to_string());
            self.request(methods::SET_SETTING, Some(json!({"cli_name": host})))
                .await;
        }
    }

    /// Live status, including the corrected polar-alignment error
    ///
    /// With `params = {"event_name": X}` only that entry is returned.
    pub fn get_event_state(&self, params: Option<&Value>) -> CommandResult {
        let mut snapshot = self.events.snapshot();

        if let (Some((x, y)), Value::Object(map)) = (self.pa_error_raw(), &mut snapshot) {
            let (alt, az) = corrected_pa_error(self.firmware_ver_int(), x, y);
            map.insert(
                events::THREE_PPA.to_string(),
                json!({"eq_offset_alt": alt, "eq_offset_az": az}),
            );
        }

        let result = match params
            .and_then(|p| p.get("event_name"))
            .and_then(Value::as_str)
        {
            Some(name) => snapshot.get(name).cloned().unwrap_or_else(|| json!({})),
            None => snapshot,
        };
        CommandResult::ok("get_event_state", result)
    }
}

fn split_message(data: &Value) -> (String, Option<Value>) {
    let method = data
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (method, data.get("params").cloned())
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}
