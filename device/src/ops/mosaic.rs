//! Mosaic capture: a grid of overlapping panels, each slewed to and stacked

use crate::context::{OperationContext, OperationOutcome};
use crate::coords::{normalize_ra_hours, resolve_target, CoordinateValue};
use crate::error::{DeviceError, DeviceResult};
use crate::session::SeestarSession;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Field of view height at dec 0, degrees
const PANEL_DEC_LENGTH: f64 = 1.29;

/// Field of view width at dec 0, hours
const PANEL_RA_LENGTH: f64 = 3.0 / 60.0;

/// Above this |dec| RA spacing is fixed at one hour
const POLAR_CAP_DEC: f64 = 85.0;

/// Granularity of the stacking and retry countdowns
pub const COUNTDOWN_STEP: Duration = Duration::from_secs(5);

/// Let the mount settle after a goto
const GOTO_SETTLE: Duration = Duration::from_secs(3);

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_panel_time() -> u64 {
    60
}

fn default_retry_wait() -> u64 {
    300
}

/// Parameters of a `start_mosaic` item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicParams {
    pub target_name: String,
    /// Use `-1` for both `ra` and `dec` to image around the current position
    pub ra: CoordinateValue,
    pub dec: CoordinateValue,
    #[serde(default = "default_true")]
    pub is_j2000: bool,
    #[serde(default)]
    pub is_use_lp_filter: bool,
    #[serde(default = "default_panel_time", alias = "session_time_sec")]
    pub panel_time_sec: u64,
    #[serde(default = "default_one")]
    pub ra_num: u32,
    #[serde(default = "default_one")]
    pub dec_num: u32,
    #[serde(default)]
    pub panel_overlap_percent: f64,
    #[serde(default)]
    pub gain: Option<i64>,
    #[serde(default)]
    pub is_use_autofocus: bool,
    /// `;`-separated panel labels, empty for all panels
    #[serde(default)]
    pub selected_panels: String,
    #[serde(default = "default_one")]
    pub num_tries: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait_s: u64,
}

impl MosaicParams {
    pub fn validate(&self) -> DeviceResult<()> {
        if self.ra_num < 1 || self.dec_num < 1 {
            return Err(DeviceError::Config(format!(
                "mosaic size {}x{} is invalid",
                self.ra_num, self.dec_num
            )));
        }
        if !(0.0..100.0).contains(&self.panel_overlap_percent) {
            return Err(DeviceError::Config(format!(
                "panel overlap {}% is out of range",
                self.panel_overlap_percent
            )));
        }
        Ok(())
    }

    fn is_single_panel(&self) -> bool {
        self.ra_num == 1 && self.dec_num == 1
    }

    fn selected(&self) -> Vec<String> {
        self.selected_panels
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One panel of a mosaic grid
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MosaicPanel {
    /// RA index then Dec index, both 1-based, e.g. `"21"`
    pub label: String,
    pub ra_index: u32,
    pub dec_index: u32,
    /// JNow hours
    pub ra: f64,
    /// JNow degrees
    pub dec: f64,
}

/// Spacing to the next panel center as (RA hours, Dec degrees)
///
/// RA spacing widens with 1/cos(dec); near the poles it is pinned at one hour.
pub fn mosaic_next_center_spacing(_ra: f64, dec: f64, overlap_percent: f64) -> (f64, f64) {
    let keep = (100.0 - overlap_percent) / 100.0;
    let delta_dec = PANEL_DEC_LENGTH * keep;
    let delta_ra = PANEL_RA_LENGTH * keep;

    if dec.abs() > POLAR_CAP_DEC {
        return (1.0, delta_dec);
    }
    (delta_ra / dec.to_radians().cos(), delta_dec)
}

/// Panel centers of an `ra_num` x `dec_num` grid around a JNow center
///
/// Rows run from south to north; within a row RA increases. Even counts
/// shift the center by half a panel so the grid stays symmetric.
pub fn mosaic_panels(
    center_ra: f64,
    center_dec: f64,
    ra_num: u32,
    dec_num: u32,
    overlap_percent: f64,
) -> Vec<MosaicPanel> {
    let (delta_ra, delta_dec) = mosaic_next_center_spacing(center_ra, center_dec, overlap_percent);
    let mut center_ra = center_ra;
    let mut center_dec = center_dec;
    if ra_num % 2 == 0 {
        center_ra += delta_ra / 2.0;
    }
    if dec_num % 2 == 0 {
        center_dec += delta_dec / 2.0;
    }

    let mut panels = Vec::with_capacity((ra_num * dec_num) as usize);
    let mut cur_dec = center_dec - f64::from(dec_num / 2) * delta_dec;
    for dec_index in 1..=dec_num {
        let (row_delta_ra, _) = mosaic_next_center_spacing(center_ra, cur_dec, overlap_percent);
        let mut cur_ra = center_ra - f64::from(ra_num / 2) * row_delta_ra;
        for ra_index in 1..=ra_num {
            panels.push(MosaicPanel {
                label: format!("{}{}", ra_index, dec_index),
                ra_index,
                dec_index,
                ra: normalize_ra_hours(cur_ra),
                dec: cur_dec,
            });
            cur_ra += row_delta_ra;
        }
        cur_dec += delta_dec;
    }
    panels
}

enum PanelEnd {
    Done,
    Failed,
    Stopped,
    Skipped,
}

impl SeestarSession {
    /// Image every (selected) panel of a mosaic
    pub async fn run_mosaic(
        self: &Arc<Self>,
        params: &MosaicParams,
        item_id: &str,
        ctx: &OperationContext,
    ) -> OperationOutcome {
        if let Err(e) = params.validate() {
            warn!("[{}] {}", self.name, e);
            return OperationOutcome::failed(e.to_string());
        }

        let (center_ra, center_dec) = match self.mosaic_center(params).await {
            Ok(center) => center,
            Err(e) => {
                warn!("[{}] Cannot resolve mosaic center: {}", self.name, e);
                return OperationOutcome::failed(e.to_string());
            }
        };

        let selected = params.selected();
        let panels: Vec<MosaicPanel> = mosaic_panels(
            center_ra,
            center_dec,
            params.ra_num,
            params.dec_num,
            params.panel_overlap_percent,
        )
        .into_iter()
        .filter(|p| selected.is_empty() || selected.contains(&p.label))
        .collect();
        if panels.is_empty() {
            return OperationOutcome::failed("no mosaic panels selected");
        }

        let mut remaining = params.panel_time_sec * panels.len() as u64;
        let progress = ctx.progress();
        let mut record = Map::new();
        record.insert("type".into(), json!("mosaic"));
        record.insert("schedule_item_id".into(), json!(item_id));
        record.insert("target_name".into(), json!(params.target_name));
        record.insert("action".into(), json!("start"));
        record.insert("item_total_time_s".into(), json!(remaining));
        record.insert("item_remaining_time_s".into(), json!(remaining));
        progress.begin(record);

        info!(
            "[{}] Mosaic {} with {} panel(s), {}s each",
            self.name,
            params.target_name,
            panels.len(),
            params.panel_time_sec
        );

        for panel in &panels {
            if ctx.is_stopped() {
                progress.action("Scheduler was requested to stop. Stopping at current mosaic.");
                return OperationOutcome::Stopped;
            }
            if ctx.is_skip_requested() {
                info!("[{}] Mosaic skipped at panel {}", self.name, panel.label);
                return OperationOutcome::Skipped;
            }

            progress.set("cur_ra_panel_num", panel.ra_index);
            progress.set("cur_dec_panel_num", panel.dec_index);

            match self
                .image_panel(params, panel, &mut remaining, ctx)
                .await
            {
                PanelEnd::Done => {}
                PanelEnd::Failed => {
                    remaining = remaining.saturating_sub(params.panel_time_sec);
                    progress.set("item_remaining_time_s", remaining);
                }
                PanelEnd::Stopped => {
                    progress.set("panel_remaining_time_s", 0);
                    progress.set("item_remaining_time_s", 0);
                    return OperationOutcome::Stopped;
                }
                PanelEnd::Skipped => return OperationOutcome::Skipped,
            }
        }

        info!("[{}] Finished mosaic {}", self.name, params.target_name);
        progress.set("item_remaining_time_s", 0);
        progress.action("complete");
        OperationOutcome::Completed
    }

    async fn mosaic_center(&self, params: &MosaicParams) -> DeviceResult<(f64, f64)> {
        if params.ra.is_current_position() && params.dec.is_current_position() {
            let position = self
                .refresh_position()
                .await
                .ok_or_else(|| DeviceError::NotConnected(self.name.clone()))?;
            return Ok((position.ra, position.dec));
        }
        resolve_target(
            &params.ra,
            &params.dec,
            params.is_j2000,
            &chrono::Utc::now(),
        )
    }

    async fn image_panel(
        self: &Arc<Self>,
        params: &MosaicParams,
        panel: &MosaicPanel,
        remaining: &mut u64,
        ctx: &OperationContext,
    ) -> PanelEnd {
        let progress = ctx.progress();
        let save_name = if params.is_single_panel() {
            params.target_name.clone()
        } else {
            format!("{}_{}", params.target_name, panel.label)
        };
        info!(
            "[{}] Mosaic goto for panel {} at {:.4}, {:.4}",
            self.name, panel.label, panel.ra, panel.dec
        );

        let mut reached = false;
        for attempt in 1..=params.num_tries.max(1) {
            progress.action(format!(
                "attempt #{} slewing to target panel centered at {:.2}, {:.2}",
                attempt, panel.ra, panel.dec
            ));
            if self.goto_panel(&save_name, panel, params, ctx).await {
                reached = true;
                break;
            }
            if ctx.is_stopped() {
                return PanelEnd::Stopped;
            }
            if attempt < params.num_tries {
                let mut waited = 0;
                while waited < params.retry_wait_s {
                    progress.action(format!(
                        "waited {}s of requested {}s before retry GOTO target.",
                        waited, params.retry_wait_s
                    ));
                    if !ctx.sleep(COUNTDOWN_STEP).await {
                        return PanelEnd::Stopped;
                    }
                    waited += COUNTDOWN_STEP.as_secs();
                }
            }
        }
        if !reached {
            let message = format!("Failed to goto target after {} tries.", params.num_tries);
            warn!("[{}] {}", self.name, message);
            progress.action(message);
            return PanelEnd::Failed;
        }

        self.set_target_name(&save_name).await;
        let gain = params.gain.unwrap_or(self.imaging.gain);
        if !self.start_stack(gain, true).await {
            warn!("[{}] Failed to start stacking {}", self.name, save_name);
            progress.action("Failed to start stacking.");
            return PanelEnd::Failed;
        }
        progress.action(format!(
            "stacking the panel for {} seconds",
            params.panel_time_sec
        ));

        let mut panel_remaining = params.panel_time_sec;
        while panel_remaining > 0 {
            progress.set("panel_remaining_time_s", panel_remaining);
            progress.set("item_remaining_time_s", *remaining);

            let step = panel_remaining.min(COUNTDOWN_STEP.as_secs());
            if !ctx.sleep(Duration::from_secs(step)).await {
                info!("[{}] Mosaic stop requested while stacking", self.name);
                progress.action("Scheduler was requested to stop. Stopping at current mosaic.");
                self.stop_stack().await;
                return PanelEnd::Stopped;
            }
            panel_remaining -= step;
            *remaining = remaining.saturating_sub(step);
            if ctx.is_skip_requested() {
                info!("[{}] Mosaic stacking skipped", self.name);
                self.stop_stack().await;
                return PanelEnd::Skipped;
            }
        }

        progress.set("panel_remaining_time_s", 0);
        progress.set("item_remaining_time_s", *remaining);
        self.stop_stack().await;
        progress.action(format!("Stacking operation finished {}", save_name));
        PanelEnd::Done
    }

    async fn goto_panel(
        self: &Arc<Self>,
        save_name: &str,
        panel: &MosaicPanel,
        params: &MosaicParams,
        ctx: &OperationContext,
    ) -> bool {
        if self.start_goto(save_name, panel.ra, panel.dec).await.is_err() {
            return false;
        }
        if !self.wait_goto_end(ctx.token()).await {
            warn!("[{}] Goto to panel {} failed", self.name, panel.label);
            return false;
        }
        if !ctx.sleep(GOTO_SETTLE).await {
            return false;
        }

        self.set_lp_filter(params.is_use_lp_filter).await;
        if params.is_use_autofocus {
            ctx.progress().action("auto focusing");
            let outcome = self.try_auto_focus(2, ctx).await;
            if !outcome.is_success() {
                info!(
                    "[{}] Failed to auto focus, but will continue to image panel anyway.",
                    self.name
                );
            }
        }
        !ctx.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MockSeestar};

    fn params(ra_num: u32, dec_num: u32) -> MosaicParams {
        serde_json::from_value(json!({
            "target_name": "M 31",
            "ra": 0.7,
            "dec": 41.3,
            "is_j2000": false,
            "panel_time_sec": 5,
            "ra_num": ra_num,
            "dec_num": dec_num,
            "panel_overlap_percent": 0
        }))
        .unwrap()
    }

    #[test]
    fn test_spacing_at_equator_and_pole() {
        let (d_ra, d_dec) = mosaic_next_center_spacing(3.0, 0.0, 0.0);
        assert!((d_ra - 0.05).abs() < 1e-12);
        assert!((d_dec - 1.29).abs() < 1e-12);

        let (d_ra, d_dec) = mosaic_next_center_spacing(3.0, 86.0, 20.0);
        assert_eq!(d_ra, 1.0);
        assert!((d_dec - 1.032).abs() < 1e-9);

        let (d_ra, _) = mosaic_next_center_spacing(3.0, 60.0, 0.0);
        assert!((d_ra - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_panel_grid_order_and_labels() {
        let panels = mosaic_panels(5.0, 0.0, 2, 2, 0.0);
        let labels: Vec<&str> = panels.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["11", "21", "12", "22"]);
        // Even grid: centers straddle the requested center.
        assert!((panels[0].dec - (0.0 + 1.29 / 2.0 - 1.29)).abs() < 1e-9);
        assert!(panels[1].ra > panels[0].ra);
        assert!(panels[2].dec > panels[0].dec);
    }

    #[test]
    fn test_single_panel_is_center() {
        let panels = mosaic_panels(5.0, 20.0, 1, 1, 10.0);
        assert_eq!(panels.len(), 1);
        assert_eq!(panels[0].ra, 5.0);
        assert_eq!(panels[0].dec, 20.0);
    }

    #[test]
    fn test_params_accept_legacy_session_time() {
        let parsed: MosaicParams = serde_json::from_value(json!({
            "target_name": "NGC 7000",
            "ra": "20h59m17.1s",
            "dec": "+44d31m44s",
            "session_time_sec": 900,
            "selected_panels": "11; 21"
        }))
        .unwrap();
        assert_eq!(parsed.panel_time_sec, 900);
        assert!(parsed.is_j2000);
        assert_eq!(parsed.selected(), vec!["11", "21"]);
        assert_eq!(parsed.retry_wait_s, 300);
    }

    #[test]
    fn test_invalid_size_rejected() {
        let mut p = params(1, 1);
        p.ra_num = 0;
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn test_single_panel_mosaic_stacks_under_target_name() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "iscope_start_view",
            vec![json!({"Event": "AutoGoto", "state": "complete"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let ctx = OperationContext::new(
            tokio_util::sync::CancellationToken::new(),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
            crate::context::ItemProgress::new(Arc::clone(session.events())),
        );
        let outcome = session.run_mosaic(&params(1, 1), "item-1", &ctx).await;
        assert_eq!(outcome, OperationOutcome::Completed);

        assert_eq!(
            mock.commands("set_sequence_setting")[0]["params"],
            json!([{"group_name": "M 31"}])
        );
        assert_eq!(mock.count_method("iscope_start_stack"), 1);
        let item = ctx.progress().current().unwrap();
        assert_eq!(item["type"], "mosaic");
        assert_eq!(item["schedule_item_id"], "item-1");
        assert_eq!(item["item_remaining_time_s"], 0);
        assert_eq!(item["cur_ra_panel_num"], 1);
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_mosaic_skips_unreachable_panel() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "iscope_start_view",
            vec![json!({"Event": "AutoGoto", "state": "fail"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let outcome = session
            .run_mosaic(&params(1, 1), "item-2", &OperationContext::detached())
            .await;
        assert_eq!(outcome, OperationOutcome::Completed);
        assert_eq!(mock.count_method("iscope_start_stack"), 0);
        session.end_watch_thread().await;
    }

    #[tokio::test]
    async fn test_mosaic_stop_while_stacking() {
        let mock = MockSeestar::start().await;
        mock.emit_after(
            "iscope_start_view",
            vec![json!({"Event": "AutoGoto", "state": "complete"})],
        );
        let session = SeestarSession::new(mock.device_config(), &test_config());
        assert!(session.start_watch_thread().await);

        let mut p = params(1, 1);
        p.panel_time_sec = 600;
        let ctx = OperationContext::detached();
        let stopper = ctx.clone();
        let mock_ref = &mock;
        let stop = async move {
            mock_ref
                .wait_for_method("set_control_value", Duration::from_secs(15))
                .await;
            stopper.request_stop();
        };
        let (outcome, _) = tokio::join!(session.run_mosaic(&p, "item-3", &ctx), stop);
        assert_eq!(outcome, OperationOutcome::Stopped);
        assert!(mock
            .commands("iscope_stop_view")
            .iter()
            .any(|c| c["params"] == json!({"stage": "Stack"})));
        session.end_watch_thread().await;
    }
}
