//! High-level telescope operations
//!
//! Each submodule adds methods to [`SeestarSession`]. Long-running operations
//! take an [`OperationContext`](crate::context::OperationContext) and return an
//! [`OperationOutcome`](crate::context::OperationOutcome); they never hold a
//! lock across a device round trip.

pub mod darks;
pub mod focus;
pub mod goto;
pub mod imaging;
pub mod mosaic;
pub mod polar_align;
pub mod power;
pub mod spectra;
pub mod startup;

use crate::event_state::WaitResult;
use crate::protocol::{response_error_message, response_failed};
use crate::session::SeestarSession;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl SeestarSession {
    /// Wait for the named operation to reach a terminal state
    pub(crate) async fn wait_op(
        &self,
        event_name: &str,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> WaitResult {
        self.events()
            .wait_end_op(
                event_name,
                self.timeouts.event_poll_interval(),
                Some(limit),
                cancel,
            )
            .await
    }

    /// Log a failed response; returns whether it succeeded
    pub(crate) fn check_response(&self, what: &str, response: &Value) -> bool {
        if response_failed(response) {
            warn!(
                "[{}] {} failed: {}",
                self.name,
                what,
                response_error_message(response).unwrap_or_default()
            );
            return false;
        }
        true
    }
}
