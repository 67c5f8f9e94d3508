//! Auto focus and manual focuser moves

use crate::context::{OperationContext, OperationOutcome};
use crate::event_state::WaitResult;
use crate::protocol::{events, methods, response_failed, OpState};
use crate::session::SeestarSession;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Pause between auto-focus attempts
const RETRY_WAIT: Duration = Duration::from_secs(5);

/// Time for the focuser to settle after the last attempt
const SETTLE_WAIT: Duration = Duration::from_secs(2);

impl SeestarSession {
    /// Run auto focus up to `try_count` times
    ///
    /// The `AutoFocus` event state is left at `complete` or `fail`.
    pub async fn try_auto_focus(&self, try_count: u32, ctx: &OperationContext) -> OperationOutcome {
        let try_count = try_count.max(1);
        let mut focused = false;

        for attempt in 1..=try_count {
            if ctx.is_stopped() {
                break;
            }
            if attempt > 1 && !ctx.sleep(RETRY_WAIT).await {
                break;
            }

            info!("[{}] Focusing try {} of {}", self.name, attempt, try_count);
            ctx.progress()
                .action(format!("auto focus try {} of {}", attempt, try_count));
            self.mark_op_state(events::AUTO_FOCUS, OpState::Working);

            let response = self.request(methods::START_AUTO_FOCUSE, None).await;
            if !self.check_response("start auto focus", &response) {
                continue;
            }
            match self
                .wait_op(events::AUTO_FOCUS, self.timeouts.auto_focus_timeout(), ctx.token())
                .await
            {
                WaitResult::Reached(OpState::Complete) => {
                    focused = true;
                    break;
                }
                WaitResult::Cancelled => break,
                other => warn!("[{}] Auto focus attempt ended: {:?}", self.name, other),
            }
        }

        ctx.sleep(SETTLE_WAIT).await;
        let final_state = if focused { OpState::Complete } else { OpState::Fail };
        self.mark_op_state(events::AUTO_FOCUS, final_state);
        info!("[{}] Auto focus completed, focused: {}", self.name, focused);

        if focused {
            OperationOutcome::Completed
        } else if ctx.is_stopped() {
            OperationOutcome::Stopped
        } else {
            OperationOutcome::failed(format!("auto focus failed after {} tries", try_count))
        }
    }

    /// Move the focuser `steps` relative to its current position
    pub async fn adjust_focus(&self, steps: i64) -> Value {
        let response = self.request(methods::GET_FOCUSER_POSITION, None).await;
        if response_failed(&response) {
            return response;
        }
        let Some(current) = response.get("result").and_then(Value::as_i64) else {
            warn!(
                "[{}] Unexpected focuser position response: {}",
                self.name, response
            );
            return json!({"error": "focuser position unavailable"});
        };

        let target = current + steps;
        info!(
            "[{}] Moving focuser {} -> {} ({:+})",
            self.name, current, target, steps
        );
        self.request(
            methods::MOVE_FOCUSER,
            Some(json!({"step": target, "ret_step": true})),
        )
        .await
    }
}
