//! Parking, shutdown and reboot

use crate::event_state::WaitResult;
use crate::protocol::{events, methods, sounds, OpState, SENT_ASYNC_RESULT};
use crate::session::SeestarSession;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl SeestarSession {
    /// Park the mount and wait for it to reach home
    pub async fn park(&self, cancel: &CancellationToken) -> bool {
        info!("[{}] Parking", self.name);
        self.mark_op_state(events::SCOPE_HOME, OpState::Working);
        let response = self
            .request(
                methods::SCOPE_PARK,
                Some(json!({"equ_mode": self.is_eq_mode()})),
            )
            .await;
        if !self.check_response("scope_park", &response) {
            return false;
        }
        matches!(
            self.wait_op(events::SCOPE_HOME, self.timeouts.park_timeout(), cancel)
                .await,
            WaitResult::Reached(OpState::Complete)
        )
    }

    /// Park, then send `pi_shutdown`
    pub fn shutdown(self: &Arc<Self>) -> Value {
        self.dispatch_power_command(methods::PI_SHUTDOWN, None)
    }

    /// Park, then send `pi_reboot`
    pub fn reboot(self: &Arc<Self>) -> Value {
        self.dispatch_power_command(methods::PI_REBOOT, None)
    }

    /// Run the park-then-power-command sequence on a detached task
    ///
    /// The device stops answering once it powers down, so callers only get an
    /// acknowledgement.
    pub(crate) fn dispatch_power_command(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Value {
        let session = Arc::clone(self);
        let command = method.to_string();
        tokio::spawn(async move {
            session.play_sound(sounds::SHUTDOWN).await;
            if !session.park(&CancellationToken::new()).await {
                warn!(
                    "[{}] Park before {} did not complete; sending it anyway",
                    session.name, command
                );
            }
            info!("[{}] Sending {}", session.name, command);
            session.send_command(&command, params).await;
        });

        json!({
            "jsonrpc": "2.0",
            "method": method,
            "code": 0,
            "result": SENT_ASYNC_RESULT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_parks_before_power_off() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "scope_park",
            vec![json!({"Event": "ScopeHome", "state": "complete"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let ack = session.shutdown();
        assert_eq!(ack["result"], SENT_ASYNC_RESULT);

        assert!(mock.wait_for_method("pi_shutdown", Duration::from_secs(10)).await);
        let methods: Vec<String> = mock
            .received_methods()
            .into_iter()
            .filter(|m| m == "play_sound" || m == "scope_park" || m == "pi_shutdown")
            .collect();
        assert_eq!(methods, vec!["play_sound", "scope_park", "pi_shutdown"]);
        assert_eq!(mock.commands("play_sound")[0]["params"], json!({"num": 13}));
        session.end_watch_thread().await;
    }
}
