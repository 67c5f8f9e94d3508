//! Dark frame library capture

use crate::context::{OperationContext, OperationOutcome};
use crate::event_state::WaitResult;
use crate::protocol::{events, methods, OpState};
use crate::session::SeestarSession;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Let the view stop before touching AutoFocus
const STOP_VIEW_SETTLE: Duration = Duration::from_secs(1);

impl SeestarSession {
    /// Capture the dark library, retrying up to `try_count` times
    pub async fn try_dark_frame(&self, try_count: u32, ctx: &OperationContext) -> OperationOutcome {
        let try_count = try_count.max(1);
        for attempt in 1..=try_count {
            if ctx.is_stopped() {
                return OperationOutcome::Stopped;
            }
            info!(
                "[{}] Dark frame measurement try {} of {}",
                self.name, attempt, try_count
            );
            ctx.progress().action("capturing dark frames");
            if self.dark_frame_once(ctx).await {
                return OperationOutcome::Completed;
            }
        }
        if ctx.is_stopped() {
            return OperationOutcome::Stopped;
        }
        OperationOutcome::failed("dark frame capture failed")
    }

    async fn dark_frame_once(&self, ctx: &OperationContext) -> bool {
        self.mark_op_state(events::DARK_LIBRARY, OpState::Working);
        self.stop_view(None).await;

        // Stopping the view leaves AutoFocus at "cancel", which would read as
        // a failed focus to anyone waiting on it.
        if !ctx.sleep(STOP_VIEW_SETTLE).await {
            return false;
        }
        if self.events().get(events::AUTO_FOCUS).is_some() {
            self.mark_op_state(events::AUTO_FOCUS, OpState::Complete);
        }

        let response = self.request(methods::START_CREATE_DARK, None).await;
        if !self.check_response("start create dark", &response) {
            return false;
        }
        let response = self
            .request(
                methods::SET_CONTROL_VALUE,
                Some(json!(["gain", self.imaging.gain])),
            )
            .await;
        self.check_response("set dark gain", &response);

        let done = matches!(
            self.wait_op(
                events::DARK_LIBRARY,
                self.timeouts.dark_frame_timeout(),
                ctx.token()
            )
            .await,
            WaitResult::Reached(OpState::Complete)
        );

        if done {
            self.stop_view(Some(events::STACK)).await;
        } else {
            warn!("[{}] Create dark frame data failed", self.name);
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};

    #[tokio::test]
    async fn test_dark_frame_sequence() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "start_create_dark",
            vec![json!({"Event": "DarkLibrary", "state": "complete", "percent": 100})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);
        session.mark_op_state(events::AUTO_FOCUS, OpState::Cancel);

        let outcome = session
            .try_dark_frame(1, &OperationContext::detached())
            .await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(session.events().state_of("AutoFocus"), Some(OpState::Complete));

        let sequence: Vec<String> = mock
            .received_methods()
            .into_iter()
            .filter(|m| m != "scope_get_equ_coord" && m != "get_device_state")
            .collect();
        assert_eq!(
            sequence,
            vec![
                "iscope_stop_view",
                "start_create_dark",
                "set_control_value",
                "iscope_stop_view"
            ]
        );
        let stops = mock.commands("iscope_stop_view");
        assert_eq!(stops[1]["params"], json!({"stage": "Stack"}));
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_dark_frame_stopped() {
        let mock = MockSeestar::start().await;
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let ctx = OperationContext::detached();
        ctx.request_stop();
        assert_eq!(session.try_dark_frame(2, &ctx).await, OperationOutcome::Stopped);
        assert_eq!(mock.count_method("start_create_dark"), 0);
        session.end_watch_thread().await;
    }
}
