//! Goto, sync and the below-horizon declination offset
//!
//! An EQ-mounted Seestar refuses targets too far below the celestial pole's
//! horizon. To reach them the session syncs the mount onto a frame shifted
//! north by a whole number of degrees, then slews and plate-solves in that
//! frame until the target is centered. Everything outside this module sees
//! true coordinates only.

use crate::coords::{resolve_target, separation_sq_deg, CoordinateValue};
use crate::event_state::WaitResult;
use crate::protocol::{events, methods, response_failed, OpState};
use crate::session::{SeestarSession, SkyPosition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const GOTO_BUSY_MESSAGE: &str = "Failed to goto target: mount is in goto routine.";

/// Solve-sync-slew rounds before an auto-center gives up
pub const MAX_AUTO_CENTER_ATTEMPTS: u32 = 7;

/// Squared separation (deg²) that counts as centered
pub const CENTERED_SEPARATION_SQ: f64 = 1e-3;

/// Time the mount needs to apply a sync
const SYNC_SETTLE: Duration = Duration::from_secs(2);

/// A goto as requested by a user or a schedule item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GotoRequest {
    #[serde(default = "default_target_name")]
    pub target_name: String,
    pub ra: CoordinateValue,
    pub dec: CoordinateValue,
    #[serde(default)]
    pub is_j2000: bool,
}

fn default_target_name() -> String {
    "unknown".to_string()
}

/// Whole-degree offset keeping `target_dec` above the reachable limit
///
/// The limit is `latitude - 90 + margin`; targets at or above it need none.
pub fn below_horizon_offset_for(latitude: f64, margin_deg: f64, target_dec: f64) -> f64 {
    let min_safe = latitude - 90.0 + margin_deg;
    if target_dec < min_safe {
        (min_safe - target_dec).ceil()
    } else {
        0.0
    }
}

impl SeestarSession {
    pub fn is_goto(&self) -> bool {
        matches!(self.events().state_of(events::AUTO_GOTO), Some(state) if state.is_active())
    }

    pub fn is_goto_completed_ok(&self) -> bool {
        self.events().state_of(events::AUTO_GOTO) == Some(OpState::Complete)
    }

    /// Offset this session would apply for a goto to `target_dec`
    pub fn required_below_horizon_offset(&self, target_dec: f64) -> f64 {
        if !self.is_eq_mode() {
            return 0.0;
        }
        let site = self.site();
        below_horizon_offset_for(site.latitude, site.below_horizon_margin_deg, target_dec)
    }

    /// Resolve user coordinates and go there
    pub async fn goto_request(self: &Arc<Self>, request: &GotoRequest) -> Value {
        match resolve_target(
            &request.ra,
            &request.dec,
            request.is_j2000,
            &chrono::Utc::now(),
        ) {
            Ok((ra, dec)) => self.goto_target(&request.target_name, ra, dec).await,
            Err(e) => {
                warn!("[{}] Rejecting goto: {}", self.name, e);
                json!({"error": e.to_string()})
            }
        }
    }

    /// Go to a JNow position, centering with plate solves when an offset applies
    pub async fn goto_target(self: &Arc<Self>, target_name: &str, ra: f64, dec: f64) -> Value {
        match self.start_goto(target_name, ra, dec).await {
            Ok(response) | Err(response) => response,
        }
    }

    /// Like [`goto_target`](Self::goto_target), separating rejection from acceptance
    pub(crate) async fn start_goto(
        self: &Arc<Self>,
        target_name: &str,
        ra: f64,
        dec: f64,
    ) -> Result<Value, Value> {
        if self.is_goto() {
            warn!("[{}] {}", self.name, GOTO_BUSY_MESSAGE);
            return Err(json!({ "result": GOTO_BUSY_MESSAGE }));
        }
        self.mark_op_state(events::AUTO_GOTO, OpState::Start);

        let offset = self.required_below_horizon_offset(dec);
        if offset != self.below_horizon_dec_offset()
            && !self.set_below_horizon_dec_offset(offset, dec).await
        {
            self.mark_op_state(events::AUTO_GOTO, OpState::Fail);
            return Err(json!({ "error": "Failed to apply below-horizon declination offset" }));
        }

        info!(
            "[{}] Going to target {} at RA {:.4} Dec {:.4}",
            self.name, target_name, ra, dec
        );

        if offset == 0.0 {
            let response = self
                .request(
                    methods::ISCOPE_START_VIEW,
                    Some(json!({
                        "mode": "star",
                        "target_ra_dec": [ra, dec],
                        "target_name": target_name,
                        "lp_filter": false
                    })),
                )
                .await;
            if !self.check_response("goto", &response) {
                self.mark_op_state(events::AUTO_GOTO, OpState::Fail);
                return Err(response);
            }
            return Ok(response);
        }

        info!(
            "[{}] Target is below the reachable limit; centering with a {} degree offset",
            self.name, offset
        );
        let token = CancellationToken::new();
        *self.goto_control.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        self.set_custom_goto_state(OpState::Start);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.auto_center(ra, dec, token).await;
        });

        Ok(json!({
            "method": "goto_target",
            "result": {"target_name": target_name, "below_horizon_dec_offset": offset}
        }))
    }

    async fn auto_center(self: Arc<Self>, ra: f64, dec: f64, token: CancellationToken) {
        self.set_custom_goto_state(OpState::Working);
        self.mark_op_state(events::AUTO_GOTO, OpState::Working);

        let mut outcome = self.center_on(ra, dec, &token).await;
        if token.is_cancelled() {
            outcome = OpState::Stopped;
        }

        info!("[{}] Auto-center finished: {}", self.name, outcome);
        self.set_custom_goto_state(outcome.clone());
        self.mark_op_state(events::AUTO_GOTO, outcome);
        self.goto_control
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    async fn center_on(&self, ra: f64, dec: f64, token: &CancellationToken) -> OpState {
        let response = self.start_star_view().await;
        self.check_response("start star view", &response);

        if !self.slew_to_ra_dec(ra, dec, token).await {
            return OpState::Fail;
        }

        for attempt in 1..=MAX_AUTO_CENTER_ATTEMPTS {
            if token.is_cancelled() {
                return OpState::Stopped;
            }
            let Some(solved) = self.plate_solve_once(token).await else {
                warn!(
                    "[{}] Plate solve failed on centering attempt {}/{}",
                    self.name, attempt, MAX_AUTO_CENTER_ATTEMPTS
                );
                continue;
            };

            let separation = separation_sq_deg(solved.ra, solved.dec, ra, dec);
            debug!(
                "[{}] Centering attempt {}: solved {:.4}/{:.4}, separation² {:.6}",
                self.name, attempt, solved.ra, solved.dec, separation
            );
            if separation < CENTERED_SEPARATION_SQ {
                return OpState::Complete;
            }

            self.sync_raw(solved.ra, solved.dec).await;
            if !self.slew_to_ra_dec(ra, dec, token).await {
                return OpState::Fail;
            }
        }
        OpState::Fail
    }

    /// Stop any goto, including a running auto-center
    pub async fn stop_goto_target(&self) -> Value {
        let custom = self
            .goto_control
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(token) = &custom {
            token.cancel();
            self.set_custom_goto_state(OpState::Stopped);
        }

        if self.is_goto() || custom.is_some() {
            return self.stop_slew().await;
        }
        json!({"result": "goto stopped already: no action taken"})
    }

    pub async fn stop_slew(&self) -> Value {
        info!("[{}] Stopping slew", self.name);
        self.request(
            methods::ISCOPE_STOP_VIEW,
            Some(json!({"stage": events::AUTO_GOTO})),
        )
        .await
    }

    /// Wait for the current goto to finish; true if it completed
    pub async fn wait_goto_end(&self, cancel: &CancellationToken) -> bool {
        let limit = if self.custom_goto_state().is_active() {
            self.timeouts.goto_timeout() * (MAX_AUTO_CENTER_ATTEMPTS + 1)
        } else {
            self.timeouts.goto_timeout()
        };
        matches!(
            self.wait_op(events::AUTO_GOTO, limit, cancel).await,
            WaitResult::Reached(OpState::Complete)
        )
    }

    /// Plain mount slew to a true position; waits for the mount to stop
    pub async fn slew_to_ra_dec(&self, ra: f64, dec: f64, cancel: &CancellationToken) -> bool {
        let device_dec = dec + self.below_horizon_dec_offset();
        info!("[{}] Slewing to {:.4}, {:.4}", self.name, ra, device_dec);

        self.mark_op_state(events::SCOPE_GOTO, OpState::Start);
        let response = self
            .request(methods::SCOPE_GOTO, Some(json!([ra, device_dec])))
            .await;
        if !self.check_response("scope_goto", &response) {
            self.mark_op_state(events::SCOPE_GOTO, OpState::Fail);
            return false;
        }

        matches!(
            self.wait_op(events::SCOPE_GOTO, self.timeouts.goto_timeout(), cancel)
                .await,
            WaitResult::Reached(OpState::Complete)
        )
    }

    /// Sync the mount to a true position; refused while a goto is running
    pub async fn sync_target(&self, ra: f64, dec: f64) -> Value {
        if self.is_goto() {
            let message = "Cannot sync target while the mount is in goto routine.";
            warn!("[{}] {}", self.name, message);
            return json!({ "error": message });
        }
        self.sync_raw(ra, dec).await
    }

    async fn sync_raw(&self, ra: f64, dec: f64) -> Value {
        let device_dec = dec + self.below_horizon_dec_offset();
        info!("[{}] Syncing to {:.4}, {:.4}", self.name, ra, device_dec);
        let response = self
            .request(methods::SCOPE_SYNC, Some(json!([ra, device_dec])))
            .await;
        if self.check_response("scope_sync", &response) {
            tokio::time::sleep(SYNC_SETTLE).await;
        }
        response
    }

    /// Move the mount into (or out of) a shifted declination frame
    ///
    /// Reads the true position, stores `offset`, then syncs the mount at that
    /// same true position so the device frame becomes `dec + offset`. On any
    /// failure the previous offset is kept.
    pub async fn set_below_horizon_dec_offset(&self, offset: f64, target_dec: f64) -> bool {
        let previous = self.below_horizon_dec_offset();
        if offset == previous {
            return true;
        }

        let Some(position) = self.refresh_position().await else {
            warn!(
                "[{}] Cannot read mount position to apply dec offset",
                self.name
            );
            return false;
        };

        let device_dec = position.dec + offset;
        let device_target = target_dec + offset;
        if !(-90.0..=90.0).contains(&device_dec) || !(-90.0..=90.0).contains(&device_target) {
            warn!(
                "[{}] Dec offset {} would move the mount out of range (dec {:.2}, target {:.2})",
                self.name, offset, device_dec, device_target
            );
            return false;
        }

        self.store_below_horizon_dec_offset(offset);
        let response = self.sync_raw(position.ra, position.dec).await;
        if response_failed(&response) {
            self.store_below_horizon_dec_offset(previous);
            return false;
        }

        info!(
            "[{}] Below-horizon dec offset {} -> {}",
            self.name, previous, offset
        );
        true
    }

    /// Move in a direction at a speed; refused while a goto is running
    pub async fn move_scope(&self, angle: i64, speed: i64, dur_sec: u64) -> bool {
        if self.is_goto() {
            warn!("[{}] Failed to move scope: mount is in goto routine.", self.name);
            return false;
        }
        let response = self
            .request(
                methods::SCOPE_SPEED_MOVE,
                Some(json!({"speed": speed, "angle": angle, "dur_sec": dur_sec})),
            )
            .await;
        self.check_response("scope_speed_move", &response)
    }

    /// Solve the current field once; returns the true position
    pub async fn plate_solve_once(&self, cancel: &CancellationToken) -> Option<SkyPosition> {
        self.mark_op_state(events::PLATE_SOLVE, OpState::Start);
        let response = self.request(methods::START_SOLVE, None).await;
        if !self.check_response("start_solve", &response) {
            return None;
        }

        match self
            .wait_op(events::PLATE_SOLVE, self.timeouts.plate_solve_timeout(), cancel)
            .await
        {
            WaitResult::Reached(OpState::Complete) => {}
            _ => return None,
        }

        let solved = self.events().get(events::PLATE_SOLVE)?;
        let pair = solved.get("result")?.get("ra_dec")?.as_array()?;
        let ra = pair.first()?.as_f64()?;
        let dec = pair.get(1)?.as_f64()?;
        Some(SkyPosition {
            ra,
            dec: dec - self.below_horizon_dec_offset(),
        })
    }
}
