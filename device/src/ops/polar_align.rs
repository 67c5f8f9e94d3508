//! Polar alignment: the device's 3-point routine and the plate-solve loop

use crate::context::{OperationContext, OperationOutcome};
use crate::coords::equatorial_to_horizontal;
use crate::event_state::WaitResult;
use crate::protocol::{events, methods, OpState};
use crate::session::{PolarAlignTracker, SeestarSession};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Firmware at which the device stopped reporting the error axes inverted
pub const PA_FIRMWARE_CUTOVER: i64 = 2368;

/// Reported when no alignment error is known
pub const UNKNOWN_PA_ERROR: f64 = 9999.9;

/// Pause before (re)starting the routine
const START_WAIT: Duration = Duration::from_secs(1);

/// Map the raw `EqModePA` (x, y) to (altitude, azimuth) error in degrees
pub fn corrected_pa_error(firmware_ver_int: i64, x: f64, y: f64) -> (f64, f64) {
    if firmware_ver_int < PA_FIRMWARE_CUTOVER {
        (-y, -x)
    } else {
        (y, x)
    }
}

impl SeestarSession {
    /// Run the device's 3-point polar alignment, retrying up to `try_count` times
    pub async fn try_3ppa(
        &self,
        try_count: u32,
        dec_pos_index: u32,
        ctx: &OperationContext,
    ) -> OperationOutcome {
        if !self.is_eq_mode() {
            warn!("[{}] Cannot do 3PPA without EQ mode", self.name);
            return OperationOutcome::failed("3PPA needs an EQ mount");
        }

        let try_count = try_count.max(1);
        for attempt in 1..=try_count {
            if !ctx.sleep(START_WAIT).await {
                return OperationOutcome::Stopped;
            }
            info!(
                "[{}] Polar alignment try {} of {}",
                self.name, attempt, try_count
            );
            ctx.progress().action("perform PA Alignment");

            self.mark_op_state(events::EQ_MODE_PA, OpState::Working);
            let response = self
                .request(
                    methods::START_POLAR_ALIGN,
                    Some(json!({"restart": true, "dec_pos_index": dec_pos_index})),
                )
                .await;
            if !self.check_response("start polar align", &response) {
                continue;
            }

            match self
                .wait_op(
                    events::EQ_MODE_PA,
                    self.timeouts.polar_align_timeout(),
                    ctx.token(),
                )
                .await
            {
                WaitResult::Reached(OpState::Complete) => {
                    if let Some((alt, az)) = self.pa_error() {
                        info!(
                            "[{}] Polar alignment error alt {:.3} az {:.3}",
                            self.name, alt, az
                        );
                    }
                    return OperationOutcome::Completed;
                }
                WaitResult::Cancelled => return OperationOutcome::Stopped,
                other => warn!("[{}] Polar alignment attempt ended: {:?}", self.name, other),
            }
        }
        OperationOutcome::failed("Failed to perform polar alignment.")
    }

    /// Corrected (altitude, azimuth) error of the last 3PPA, if any
    pub fn pa_error(&self) -> Option<(f64, f64)> {
        self.pa_error_raw()
            .map(|(x, y)| corrected_pa_error(self.firmware_ver_int(), x, y))
    }

    /// Start continuous plate solving for manual polar-alignment refinement
    ///
    /// The first solve becomes the reference; each failure or success
    /// schedules the next solve until [`stop_plate_solve_loop`](Self::stop_plate_solve_loop).
    pub async fn start_plate_solve_loop(&self) -> Value {
        info!("[{}] Starting plate solve loop", self.name);
        *self.polar.lock().unwrap_or_else(|p| p.into_inner()) = PolarAlignTracker {
            in_session: true,
            auto_retry: true,
            ..Default::default()
        };
        self.mark_op_state(events::PLATE_SOLVE, OpState::Start);
        self.request(methods::START_SOLVE, None).await
    }

    pub async fn stop_plate_solve_loop(&self) -> Value {
        info!("[{}] Stopping plate solve loop", self.name);
        {
            let mut polar = self.polar.lock().unwrap_or_else(|p| p.into_inner());
            polar.auto_retry = false;
            polar.in_session = false;
        }
        self.request(methods::STOP_POLAR_ALIGN, None).await
    }

    /// Current polar-alignment error as `{pa_error_alt, pa_error_az}`
    ///
    /// Prefers the 3PPA result; otherwise the drift between the plate-solve
    /// loop's reference and latest solve in horizontal coordinates.
    pub fn get_pa_error(&self) -> Value {
        if let Some((alt, az)) = self.pa_error() {
            return json!({"pa_error_alt": alt, "pa_error_az": az});
        }

        let tracker = self.polar_align_tracker();
        if let (Some(reference), Some(current)) = (tracker.reference, tracker.current) {
            let site = self.site();
            let now = chrono::Utc::now();
            let (ref_alt, ref_az) = equatorial_to_horizontal(
                reference.ra,
                reference.dec,
                site.latitude,
                site.longitude,
                &now,
            );
            let (cur_alt, cur_az) = equatorial_to_horizontal(
                current.ra,
                current.dec,
                site.latitude,
                site.longitude,
                &now,
            );
            let mut d_az = cur_az - ref_az;
            if d_az > 180.0 {
                d_az -= 360.0;
            } else if d_az < -180.0 {
                d_az += 360.0;
            }
            return json!({"pa_error_alt": cur_alt - ref_alt, "pa_error_az": d_az});
        }

        json!({"pa_error_alt": UNKNOWN_PA_ERROR, "pa_error_az": UNKNOWN_PA_ERROR})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, SeestarConfig};
    use crate::testing::{test_config, MockSeestar};

    #[test]
    fn test_corrected_pa_error_by_firmware() {
        assert_eq!(corrected_pa_error(2300, 0.5, -1.0), (1.0, -0.5));
        assert_eq!(corrected_pa_error(2368, 0.5, -1.0), (-1.0, 0.5));
    }

    #[test]
    fn test_pa_error_unknown_then_from_3ppa() {
        let session = SeestarSession::new(DeviceConfig::default(), &SeestarConfig::default());
        let unknown = session.get_pa_error();
        assert_eq!(unknown["pa_error_alt"], UNKNOWN_PA_ERROR);
        assert_eq!(unknown["pa_error_az"], UNKNOWN_PA_ERROR);

        session.set_firmware_ver_int(2000);
        session.handle_inbound_line(r#"{"Event":"EqModePA","state":"complete","x":0.25,"y":0.75}"#);
        let error = session.get_pa_error();
        assert_eq!(error["pa_error_alt"], -0.75);
        assert_eq!(error["pa_error_az"], -0.25);
    }

    #[test]
    fn test_pa_error_from_solve_drift() {
        let session = SeestarSession::new(DeviceConfig::default(), &SeestarConfig::default());
        session.polar.lock().unwrap().in_session = true;
        session.handle_inbound_line(
            r#"{"Event":"PlateSolve","state":"complete","result":{"ra_dec":[2.0,80.0]}}"#,
        );
        session.handle_inbound_line(
            r#"{"Event":"PlateSolve","state":"complete","result":{"ra_dec":[2.0,80.0]}}"#,
        );
        let error = session.get_pa_error();
        assert!(error["pa_error_alt"].as_f64().unwrap().abs() < 1e-6);
        assert!(error["pa_error_az"].as_f64().unwrap().abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_3ppa_requires_eq_mode() {
        let session = SeestarSession::new(DeviceConfig::default(), &SeestarConfig::default());
        let outcome = session.try_3ppa(1, 3, &OperationContext::detached()).await;
        assert!(matches!(outcome, OperationOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_3ppa_completes() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "start_polar_align",
            vec![json!({"Event": "EqModePA", "state": "complete", "x": 0.1, "y": 0.2})],
        );
        let mut device = mock.device_config();
        device.is_eq_mode = true;
        let session = SeestarSession::new(device, &test_config());
        assert!(session.start_watch_thread().await);

        let outcome = session.try_3ppa(2, 3, &OperationContext::detached()).await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(
            mock.commands("start_polar_align")[0]["params"],
            json!({"restart": true, "dec_pos_index": 3})
        );
        assert_eq!(session.pa_error(), Some((0.2, 0.1)));
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_plate_solve_loop_retries_until_stopped() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "start_solve",
            vec![json!({"Event": "PlateSolve", "state": "fail"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        session.start_plate_solve_loop().await;
        let retried = tokio::time::timeout(Duration::from_secs(10), async {
            while mock.count_method("start_solve") < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(retried.is_ok());

        session.stop_plate_solve_loop().await;
        assert!(!session.polar_align_tracker().auto_retry);
        assert_eq!(mock.count_method("stop_polar_align"), 1);
        session.end_watch_thread().await;
    }
}
