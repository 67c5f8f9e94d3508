//! Spectra capture with a grating: the star first, then its spectrum orders
//!
//! The dispersed light cannot be plate-solved, so every move is a plain mount
//! slew from the star's position.

use crate::context::{OperationContext, OperationOutcome};
use crate::coords::{resolve_target, CoordinateValue};
use crate::session::SeestarSession;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::time::Duration;
use tracing::{info, warn};

use super::mosaic::COUNTDOWN_STEP;

/// Declination offsets from the star (degrees) and whether each uses the LP filter
pub const SPECTRA_OFFSETS: [(f64, bool); 8] = [
    (5.3, false),
    (6.2, false),
    (6.5, true),
    (7.1, false),
    (8.0, false),
    (8.9, false),
    (9.2, true),
    (9.8, false),
];

fn default_true() -> bool {
    true
}

fn default_panel_time() -> u64 {
    60
}

fn default_reference_time() -> u64 {
    60
}

/// Parameters of a `start_spectra` item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectraParams {
    pub target_name: String,
    pub ra: CoordinateValue,
    pub dec: CoordinateValue,
    #[serde(default = "default_true")]
    pub is_j2000: bool,
    /// Stacking time per offset
    #[serde(default = "default_panel_time", alias = "session_time_sec")]
    pub panel_time_sec: u64,
    /// Stacking time on the star itself
    #[serde(default = "default_reference_time")]
    pub reference_time_sec: u64,
    #[serde(default)]
    pub gain: Option<i64>,
}

enum StackEnd {
    Done,
    Stopped,
    Skipped,
}

impl SeestarSession {
    pub async fn run_spectra(
        &self,
        params: &SpectraParams,
        item_id: &str,
        ctx: &OperationContext,
    ) -> OperationOutcome {
        let progress = ctx.progress();
        let total = params.reference_time_sec + params.panel_time_sec * SPECTRA_OFFSETS.len() as u64;
        let mut remaining = total;

        let mut record = Map::new();
        record.insert("type".into(), json!("spectra"));
        record.insert("schedule_item_id".into(), json!(item_id));
        record.insert("target_name".into(), json!(params.target_name));
        record.insert("action".into(), json!("slew to target"));
        record.insert("item_total_time_s".into(), json!(total));
        record.insert("item_remaining_time_s".into(), json!(remaining));
        progress.begin(record);

        let (center_ra, center_dec) = if params.ra.is_current_position() {
            match self.refresh_position().await {
                Some(position) => (position.ra, position.dec),
                None => return OperationOutcome::failed("mount position unavailable"),
            }
        } else {
            let (ra, dec) = match resolve_target(
                &params.ra,
                &params.dec,
                params.is_j2000,
                &chrono::Utc::now(),
            ) {
                Ok(target) => target,
                Err(e) => return OperationOutcome::failed(e.to_string()),
            };
            if !self.slew_to_ra_dec(ra, dec, ctx.token()).await {
                warn!("[{}] Failed to slew to spectra star", self.name);
                return OperationOutcome::failed("slew to star failed");
            }
            (ra, dec)
        };

        if ctx.is_stopped() {
            return OperationOutcome::Stopped;
        }
        let gain = params.gain.unwrap_or(self.imaging.gain);

        self.set_target_name(&format!("{}_star", params.target_name))
            .await;
        if !self.start_stack(gain, true).await {
            return OperationOutcome::failed("Failed to start stacking.");
        }
        progress.action(format!(
            "stack for reference star for {} seconds",
            params.reference_time_sec
        ));
        match self
            .countdown(params.reference_time_sec, &mut remaining, ctx)
            .await
        {
            StackEnd::Done => {}
            StackEnd::Stopped => return OperationOutcome::Stopped,
            StackEnd::Skipped => return OperationOutcome::Skipped,
        }

        for (index, (offset, use_lp)) in SPECTRA_OFFSETS.iter().enumerate() {
            if ctx.is_stopped() {
                return OperationOutcome::Stopped;
            }

            self.set_lp_filter(*use_lp).await;
            let dec = center_dec + offset;
            if !self.slew_to_ra_dec(center_ra, dec, ctx.token()).await {
                warn!(
                    "[{}] Slew to spectra offset {} failed; skipping it",
                    self.name, offset
                );
                remaining = remaining.saturating_sub(params.panel_time_sec);
                continue;
            }

            self.set_target_name(&format!("{}_spec_{}", params.target_name, index + 1))
                .await;
            if !self.start_stack(gain, true).await {
                return OperationOutcome::failed("Failed to start stacking.");
            }
            progress.action(format!("stack for spectra at spacing index {}", index));
            match self
                .countdown(params.panel_time_sec, &mut remaining, ctx)
                .await
            {
                StackEnd::Done => {}
                StackEnd::Stopped => return OperationOutcome::Stopped,
                StackEnd::Skipped => return OperationOutcome::Skipped,
            }
        }

        info!("[{}] Finished spectra of {}", self.name, params.target_name);
        progress.set("item_remaining_time_s", 0);
        progress.action("complete");
        OperationOutcome::Completed
    }

    /// Stack for `seconds`, publishing remaining time; always stops the stack
    async fn countdown(&self, seconds: u64, remaining: &mut u64, ctx: &OperationContext) -> StackEnd {
        let progress = ctx.progress();
        let mut left = seconds;
        while left > 0 {
            progress.set("panel_remaining_time_s", left);
            progress.set("item_remaining_time_s", *remaining);
            let step = left.min(COUNTDOWN_STEP.as_secs());
            if !ctx.sleep(Duration::from_secs(step)).await {
                self.stop_stack().await;
                return StackEnd::Stopped;
            }
            left -= step;
            *remaining = remaining.saturating_sub(step);
            if ctx.is_skip_requested() {
                self.stop_stack().await;
                return StackEnd::Skipped;
            }
        }
        progress.set("panel_remaining_time_s", 0);
        self.stop_stack().await;
        StackEnd::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};

    #[test]
    fn test_offsets_table() {
        let lp: Vec<bool> = SPECTRA_OFFSETS.iter().map(|(_, lp)| *lp).collect();
        assert_eq!(lp, vec![false, false, true, false, false, false, true, false]);
        assert!(SPECTRA_OFFSETS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn test_spectra_star_then_first_order_until_skipped() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "scope_goto",
            vec![json!({"Event": "ScopeGoto", "state": "complete"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let params: SpectraParams = serde_json::from_value(json!({
            "target_name": "Vega",
            "ra": 18.6,
            "dec": 38.8,
            "is_j2000": false,
            "panel_time_sec": 5,
            "reference_time_sec": 5
        }))
        .unwrap();

        let ctx = OperationContext::detached();
        let skipper = ctx.clone();
        let mock_ref = &mock;
        let skip = async move {
            while !mock_ref
                .commands("set_sequence_setting")
                .iter()
                .any(|c| c["params"][0]["group_name"] == "Vega_spec_1")
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            skipper.request_skip();
        };
        let (outcome, _) = tokio::join!(session.run_spectra(&params, "item-s", &ctx), skip);
        assert_eq!(outcome, OperationOutcome::Skipped);

        let slews = mock.commands("scope_goto");
        assert_eq!(slews[0]["params"], json!([18.6, 38.8]));
        let second = slews[1]["params"].as_array().unwrap();
        assert!((second[1].as_f64().unwrap() - 44.1).abs() < 1e-9);
        assert_eq!(
            mock.commands("set_sequence_setting")[0]["params"],
            json!([{"group_name": "Vega_star"}])
        );
        session.end_watch_thread().await;
    }
}
