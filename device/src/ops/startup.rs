//! Start-up sequence: configure the device, aim it and calibrate

use crate::context::{OperationContext, OperationOutcome};
use crate::coords::separation_sq_deg;
use crate::protocol::methods;
use crate::session::SeestarSession;
use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Coarse moves allowed while aiming the arm
const MAX_AIM_MOVES: u32 = 12;

/// Aim is close enough within this many degrees on each axis
const AIM_TOLERANCE_DEG: f64 = 3.0;

/// Speed used for coarse aiming moves
const AIM_SPEED: i64 = 5000;

/// Approximate slew rate at [`AIM_SPEED`], degrees per second
const AIM_DEG_PER_SEC: f64 = 5.0;

/// Longest single aiming move
const MAX_AIM_MOVE_SECS: u64 = 10;

/// Maximum squared separation (deg²) for the reference check to pass
const VERIFY_SEPARATION_SQ: f64 = 0.05;

fn default_dec_pos_index() -> u32 {
    3
}

fn default_aim_altitude() -> f64 {
    60.0
}

fn default_aim_azimuth() -> f64 {
    180.0
}

/// Options of a start-up sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupParams {
    /// Site latitude; falls back to the configured site
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    /// Park, then raise the arm towards the aim point
    #[serde(default)]
    pub move_arm: bool,
    #[serde(default = "default_aim_altitude")]
    pub aim_altitude: f64,
    #[serde(default = "default_aim_azimuth")]
    pub aim_azimuth: f64,
    #[serde(default)]
    pub auto_focus: bool,
    #[serde(default)]
    pub dark_frames: bool,
    #[serde(default, rename = "3ppa")]
    pub polar_align: bool,
    #[serde(default = "default_dec_pos_index")]
    pub dec_pos_index: u32,
    /// Solve, sync, re-slew and re-solve to confirm the pointing model
    #[serde(default)]
    pub verify_reference: bool,
}

impl Default for StartupParams {
    fn default() -> Self {
        Self {
            lat: None,
            lon: None,
            move_arm: false,
            aim_altitude: default_aim_altitude(),
            aim_azimuth: default_aim_azimuth(),
            auto_focus: false,
            dark_frames: false,
            polar_align: false,
            dec_pos_index: default_dec_pos_index(),
            verify_reference: false,
        }
    }
}

impl SeestarSession {
    /// Run the start-up sequence; the first failing sub-step ends it
    ///
    /// Star view is re-established however the sequence ends.
    pub async fn run_start_up_sequence(
        &self,
        params: &StartupParams,
        ctx: &OperationContext,
    ) -> OperationOutcome {
        let mut record = Map::new();
        record.insert("type".into(), json!("start_up_sequence"));
        record.insert("schedule_item_id".into(), json!("Not Applicable"));
        record.insert("action".into(), json!("set configurations"));
        ctx.progress().begin(record);

        let outcome = self.start_up_steps(params, ctx).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        if !self.ensure_star_view().await {
            warn!("[{}] Could not restore star view after start-up", self.name);
        }
        match &outcome {
            OperationOutcome::Completed => ctx.progress().action("complete"),
            OperationOutcome::Failed(reason) => ctx.progress().action(reason.clone()),
            _ => {}
        }
        info!("[{}] Start-up sequence result: {:?}", self.name, outcome);
        outcome
    }

    async fn start_up_steps(&self, params: &StartupParams, ctx: &OperationContext) -> OperationOutcome {
        let progress = ctx.progress();

        if let (Some(lat), Some(lon)) = (params.lat, params.lon) {
            if lat != 0.0 || lon != 0.0 {
                self.set_site_location(lat, lon);
            }
        }
        let site = self.site();
        let message = format!(
            "Setting location to {}, {}",
            site.latitude, site.longitude
        );
        info!("[{}] {}", self.name, message);
        progress.action(message);

        let now = Local::now();
        let time_zone = site.time_zone.clone().unwrap_or_else(|| "UTC".to_string());
        let response = self
            .request(
                methods::PI_SET_TIME,
                Some(json!([{
                    "year": now.year(),
                    "mon": now.month(),
                    "day": now.day(),
                    "hour": now.hour(),
                    "min": now.minute(),
                    "sec": now.second(),
                    "time_zone": time_zone
                }])),
            )
            .await;
        self.check_response("pi_set_time", &response);

        let response = self
            .request(
                methods::SET_USER_LOCATION,
                Some(json!({"lat": site.latitude, "lon": site.longitude, "force": true})),
            )
            .await;
        self.check_response("set_user_location", &response);
        self.request(methods::SET_SETTING, Some(json!({"lang": "en"})))
            .await;

        self.apply_imaging_settings().await;
        self.action_set_dew_heater(self.imaging.dew_heater_power)
            .await;
        self.request(
            methods::SET_STACK_SETTING,
            Some(json!({
                "save_discrete_ok_frame": self.imaging.save_good_frames,
                "save_discrete_frame": self.imaging.save_all_frames
            })),
        )
        .await;

        let response = self.request(methods::GET_DEVICE_STATE, None).await;
        if let Some(version) = response
            .get("result")
            .and_then(|r| r.get("device"))
            .and_then(|d| d.get("firmware_ver_int"))
            .and_then(Value::as_i64)
        {
            self.set_firmware_ver_int(version);
        }

        if ctx.is_stopped() {
            return OperationOutcome::Stopped;
        }

        if params.move_arm {
            progress.action("park the scope before raising the arm");
            if !self.park(ctx.token()).await {
                if ctx.is_stopped() {
                    return OperationOutcome::Stopped;
                }
                return OperationOutcome::failed("Failed to park the mount.");
            }
            progress.action(format!(
                "moving scope's aim toward alt {:.0}, az {:.0}",
                params.aim_altitude, params.aim_azimuth
            ));
            if !self
                .aim_arm(params.aim_altitude, params.aim_azimuth, ctx)
                .await
            {
                if ctx.is_stopped() {
                    return OperationOutcome::Stopped;
                }
                return OperationOutcome::failed("Failed to aim the arm.");
            }
        }

        if params.auto_focus {
            if !params.move_arm {
                warn!(
                    "[{}] Auto focus needs the arm raised; skipping it",
                    self.name
                );
            } else {
                self.ensure_star_view().await;
                progress.action("auto focus");
                match self.try_auto_focus(2, ctx).await {
                    OperationOutcome::Completed => {}
                    OperationOutcome::Stopped => return OperationOutcome::Stopped,
                    _ => return OperationOutcome::failed("Auto focus was unsuccessful."),
                }
            }
        }

        if params.dark_frames {
            progress.action("dark frame measurement");
            match self.try_dark_frame(1, ctx).await {
                OperationOutcome::Completed => {}
                OperationOutcome::Stopped => return OperationOutcome::Stopped,
                _ => return OperationOutcome::failed("Failed to take dark frame data."),
            }
        }

        if params.polar_align {
            if !self.is_eq_mode() {
                warn!("[{}] Cannot do 3PPA without EQ mode; skipping it", self.name);
            } else {
                match self.try_3ppa(1, params.dec_pos_index, ctx).await {
                    OperationOutcome::Completed => {}
                    OperationOutcome::Stopped => return OperationOutcome::Stopped,
                    other => return other,
                }
            }
        }

        if params.verify_reference {
            progress.action("verify reference point");
            if !self.verify_reference(ctx).await {
                if ctx.is_stopped() {
                    return OperationOutcome::Stopped;
                }
                return OperationOutcome::failed("Reference point verification failed.");
            }
        }

        OperationOutcome::Completed
    }

    /// Coarse alt-az moves towards a target until within tolerance
    async fn aim_arm(&self, altitude: f64, azimuth: f64, ctx: &OperationContext) -> bool {
        for _ in 0..MAX_AIM_MOVES {
            if ctx.is_stopped() {
                return false;
            }
            let response = self.request(methods::SCOPE_GET_HORIZ_COORD, None).await;
            let Some((alt, az)) = response
                .get("result")
                .and_then(Value::as_array)
                .and_then(|pair| Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?)))
            else {
                warn!("[{}] Unreadable alt-az position: {}", self.name, response);
                return false;
            };

            let d_alt = altitude - alt;
            let mut d_az = azimuth - az;
            if d_az > 180.0 {
                d_az -= 360.0;
            } else if d_az < -180.0 {
                d_az += 360.0;
            }
            if d_alt.abs() <= AIM_TOLERANCE_DEG && d_az.abs() <= AIM_TOLERANCE_DEG {
                info!("[{}] Arm aimed at alt {:.1} az {:.1}", self.name, alt, az);
                return true;
            }

            let (angle, distance) = if d_alt.abs() > AIM_TOLERANCE_DEG {
                (if d_alt > 0.0 { 90 } else { 270 }, d_alt.abs())
            } else {
                (if d_az > 0.0 { 0 } else { 180 }, d_az.abs())
            };
            let secs = ((distance / AIM_DEG_PER_SEC).ceil() as u64).clamp(1, MAX_AIM_MOVE_SECS);
            if !self.move_scope(angle, AIM_SPEED, secs).await {
                return false;
            }
            if !ctx.sleep(Duration::from_secs(secs)).await {
                self.move_scope(angle, 0, 0).await;
                return false;
            }
            self.move_scope(angle, 0, 0).await;
        }
        warn!(
            "[{}] Arm not aimed after {} moves",
            self.name, MAX_AIM_MOVES
        );
        false
    }

    /// Solve, sync to the solution, slew back onto it and check a second solve
    async fn verify_reference(&self, ctx: &OperationContext) -> bool {
        let Some(first) = self.plate_solve_once(ctx.token()).await else {
            return false;
        };
        let response = self.sync_target(first.ra, first.dec).await;
        if !self.check_response("reference sync", &response) {
            return false;
        }
        if !self.slew_to_ra_dec(first.ra, first.dec, ctx.token()).await {
            return false;
        }
        let Some(second) = self.plate_solve_once(ctx.token()).await else {
            return false;
        };
        let separation = separation_sq_deg(first.ra, first.dec, second.ra, second.dec);
        info!(
            "[{}] Reference check separation² {:.5} deg²",
            self.name, separation
        );
        separation < VERIFY_SEPARATION_SQ
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};

    #[test]
    fn test_params_defaults_and_3ppa_key() {
        let params: StartupParams =
            serde_json::from_value(json!({"3ppa": true, "lat": 52.0, "lon": 4.5})).unwrap();
        assert!(params.polar_align);
        assert_eq!(params.dec_pos_index, 3);
        assert!(!params.move_arm);
        assert_eq!(params.lat, Some(52.0));
    }

    #[tokio::test]
    async fn test_minimal_start_up_configures_device() {
        let mock = MockSeestar::start().await;
        mock.respond_with(
            "get_view_state",
            json!({"View": {"mode": "star", "state": "working"}}),
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let params = StartupParams {
            lat: Some(52.0),
            lon: Some(4.5),
            ..Default::default()
        };
        let outcome = session
            .run_start_up_sequence(&params, &OperationContext::detached())
            .await;
        assert_eq!(outcome, OperationOutcome::Completed);

        assert_eq!(session.site().latitude, 52.0);
        assert_eq!(
            mock.commands("set_user_location")[0]["params"],
            json!({"lat": 52.0, "lon": 4.5, "force": true})
        );
        assert_eq!(mock.count_method("pi_set_time"), 1);
        assert_eq!(mock.count_method("pi_output_set2"), 1);
        assert_eq!(mock.count_method("set_stack_setting"), 1);
        assert_eq!(mock.count_method("scope_park"), 0);
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_failed_dark_frames_stop_sequence_but_restore_view() {
        let mock = MockSeestar::start().await;
        mock.respond_error("start_create_dark", "camera busy");
        mock.respond_with("get_view_state", json!({"View": {"state": "idle"}}));
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let params = StartupParams {
            dark_frames: true,
            polar_align: true,
            ..Default::default()
        };
        let outcome = session
            .run_start_up_sequence(&params, &OperationContext::detached())
            .await;
        assert_eq!(
            outcome,
            OperationOutcome::failed("Failed to take dark frame data.")
        );
        assert_eq!(mock.count_method("start_polar_align"), 0);
        assert_eq!(mock.count_method("iscope_start_view"), 1);
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_arm_aiming_moves_up_then_stops() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "scope_park",
            vec![json!({"Event": "ScopeHome", "state": "complete"})],
        );
        mock.respond_with("scope_get_horiz_coord", json!([59.0, 181.0]));
        mock.respond_with(
            "get_view_state",
            json!({"View": {"mode": "star", "state": "working"}}),
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let params = StartupParams {
            move_arm: true,
            ..Default::default()
        };
        let outcome = session
            .run_start_up_sequence(&params, &OperationContext::detached())
            .await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(mock.count_method("scope_park"), 1);
        assert_eq!(mock.count_method("scope_speed_move"), 0);
        session.end_watch_thread().await;
    }
}
