//! Viewing, stacking and camera settings

use crate::protocol::{events, methods, response_failed, OpState};
use crate::session::SeestarSession;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Pause before the single `iscope_start_stack` retry
const STACK_RETRY_WAIT: Duration = Duration::from_secs(2);

/// Time the device needs to finish playing a sound
const SOUND_WAIT: Duration = Duration::from_secs(1);

impl SeestarSession {
    /// Switch the device into star view without a target
    pub async fn start_star_view(&self) -> Value {
        self.request(methods::ISCOPE_START_VIEW, Some(json!({"mode": "star"})))
            .await
    }

    /// Make sure the device is in star view, starting it if needed
    pub async fn ensure_star_view(&self) -> bool {
        let response = self.request(methods::GET_VIEW_STATE, None).await;
        let view = response
            .get("result")
            .and_then(|r| r.get("View"))
            .cloned()
            .unwrap_or(Value::Null);
        let mode = view.get("mode").and_then(Value::as_str);
        let state = view.get("state").and_then(Value::as_str);
        if mode == Some("star") && state == Some("working") {
            return true;
        }

        info!("[{}] Starting star view (mode {:?})", self.name, mode);
        let response = self.start_star_view().await;
        self.check_response("iscope_start_view", &response)
    }

    /// Stop the given view stage, or the whole view when `stage` is `None`
    pub async fn stop_view(&self, stage: Option<&str>) -> Value {
        let params = stage.map(|s| json!({"stage": s}));
        self.request(methods::ISCOPE_STOP_VIEW, params).await
    }

    /// Start stacking at `gain`, retrying once
    pub async fn start_stack(&self, gain: i64, restart: bool) -> bool {
        let params = json!({"restart": restart});
        let mut response = self
            .request(methods::ISCOPE_START_STACK, Some(params.clone()))
            .await;
        if response_failed(&response) {
            warn!(
                "[{}] Failed to start stack, trying again in {:?}",
                self.name, STACK_RETRY_WAIT
            );
            tokio::time::sleep(STACK_RETRY_WAIT).await;
            response = self
                .request(methods::ISCOPE_START_STACK, Some(params))
                .await;
            if !self.check_response("iscope_start_stack", &response) {
                return false;
            }
        }

        self.set_stacking(true);
        self.mark_op_state(events::STACK, OpState::Working);
        let response = self
            .request(methods::SET_CONTROL_VALUE, Some(json!(["gain", gain])))
            .await;
        self.check_response("set gain", &response);
        true
    }

    pub async fn stop_stack(&self) -> bool {
        let response = self.stop_view(Some(events::STACK)).await;
        self.set_stacking(false);
        self.check_response("stop stack", &response)
    }

    /// Name the next stack's output folder
    pub async fn set_target_name(&self, name: &str) -> Value {
        self.request(
            methods::SET_SEQUENCE_SETTING,
            Some(json!([{"group_name": name}])),
        )
        .await
    }

    pub async fn play_sound(&self, num: u32) -> Value {
        let response = self
            .request(methods::PLAY_SOUND, Some(json!({"num": num})))
            .await;
        tokio::time::sleep(SOUND_WAIT).await;
        response
    }

    pub async fn set_lp_filter(&self, enabled: bool) -> Value {
        self.request(
            methods::SET_SETTING,
            Some(json!({"stack_lenhance": enabled})),
        )
        .await
    }

    /// Push the configured imaging settings to the device
    pub async fn apply_imaging_settings(&self) -> bool {
        let imaging = &self.imaging;
        let settings = [
            json!({"auto_af": imaging.auto_af}),
            json!({"stack_after_goto": imaging.stack_after_goto}),
            json!({"exp_ms": {
                "stack_l": imaging.exposure_stack_ms,
                "continuous": imaging.exposure_continuous_ms
            }}),
            json!({"stack_dither": {
                "pix": imaging.dither_length_pixel,
                "interval": imaging.dither_frequency,
                "enable": imaging.dither_enabled
            }}),
            json!({"stack_lenhance": imaging.activate_lp_filter}),
            json!({"stack": {"dbe": imaging.dbe_enabled}}),
            json!({"frame_calib": imaging.frame_calibrated}),
            json!({"save_discrete_ok_frame": imaging.save_good_frames}),
            json!({"save_discrete_frame": imaging.save_all_frames}),
        ];

        let mut ok = true;
        for setting in settings {
            let response = self.request(methods::SET_SETTING, Some(setting)).await;
            ok &= self.check_response("set_setting", &response);
        }
        ok
    }

    /// Set the dew heater power in percent; 0 switches it off
    pub async fn action_set_dew_heater(&self, heater: i64) -> Value {
        let heater = heater.clamp(0, 100);
        self.request(
            methods::PI_OUTPUT_SET2,
            Some(json!({"heater": {"state": heater > 0, "value": heater}})),
        )
        .await
    }

    /// Set the per-frame stacking exposure in milliseconds
    pub async fn action_set_exposure(&self, exp_ms: u64) -> Value {
        self.request(
            methods::SET_SETTING,
            Some(json!({"exp_ms": {"stack_l": exp_ms}})),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};

    #[tokio::test]
    async fn test_start_stack_retries_then_sets_gain() {
        let mock = MockSeestar::start().await;
        mock.respond_error("iscope_start_stack", "fail to start stack");
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        assert!(!session.start_stack(80, true).await);
        assert_eq!(mock.count_method("iscope_start_stack"), 2);
        assert!(!session.is_stacking());

        mock.respond_with("iscope_start_stack", json!(0));
        assert!(session.start_stack(90, true).await);
        assert!(session.is_stacking());
        let gain = mock.commands("set_control_value");
        assert_eq!(gain.last().unwrap()["params"], json!(["gain", 90]));

        assert!(session.stop_stack().await);
        assert!(!session.is_stacking());
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_ensure_star_view_only_starts_when_needed() {
        let mock = MockSeestar::start().await;
        mock.respond_with(
            "get_view_state",
            json!({"View": {"mode": "star", "state": "working"}}),
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        assert!(session.ensure_star_view().await);
        assert_eq!(mock.count_method("iscope_start_view"), 0);
        assert_eq!(session.view_state()["View"]["mode"], "star");

        mock.respond_with("get_view_state", json!({"View": {"state": "idle"}}));
        assert!(session.ensure_star_view().await);
        assert_eq!(mock.count_method("iscope_start_view"), 1);
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_settings_helpers_send_expected_params() {
        let mock = MockSeestar::start().await;
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        session.action_set_dew_heater(150).await;
        session.action_set_exposure(20000).await;
        session.set_target_name("M 31").await;

        assert_eq!(
            mock.commands("pi_output_set2")[0]["params"],
            json!({"heater": {"state": true, "value": 100}})
        );
        assert_eq!(
            mock.commands("set_setting")[0]["params"],
            json!({"exp_ms": {"stack_l": 20000}})
        );
        assert_eq!(
            mock.commands("set_sequence_setting")[0]["params"],
            json!([{"group_name": "M 31"}])
        );
        session.end_watch_thread().await;
    }
}
