//! Schedule items
//!
//! On the wire an item is `{"action": ..., "params": ..., "schedule_item_id": ...}`.
//! Known actions parse into typed parameters; any other action name is kept
//! as a raw device command and sent as-is when the item runs.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::NaiveTime;
use seestar_device::coords::{round_to, trim_seconds};
use seestar_device::{CoordinateValue, MosaicParams, SkyPosition, SpectraParams, StartupParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// How a federation shares one mosaic among its devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationMode {
    /// Every device images the whole mosaic
    #[default]
    Duplicate,
    /// Every device images every panel for a share of the time
    ByTime,
    /// Panels are divided among the devices
    ByPanel,
}

/// Mosaic parameters plus the federation split, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicItem {
    #[serde(flatten)]
    pub mosaic: MosaicParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation_mode: Option<FederationMode>,
}

/// What a schedule item does
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleAction {
    StartMosaic(MosaicItem),
    StartSpectra(SpectraParams),
    AutoFocus { try_count: u32 },
    AdjustFocus { steps: i64 },
    Shutdown,
    WaitFor { timer_sec: u64 },
    WaitUntil { local_time: NaiveTime },
    StartUpSequence(StartupParams),
    SetDewHeater { heater: i64 },
    SetExposure { exp: u64 },
    /// Any other action: sent to the device as `{method, params}`
    Passthrough { method: String, params: Option<Value> },
}

impl ScheduleAction {
    pub fn name(&self) -> &str {
        match self {
            ScheduleAction::StartMosaic(_) => "start_mosaic",
            ScheduleAction::StartSpectra(_) => "start_spectra",
            ScheduleAction::AutoFocus { .. } => "auto_focus",
            ScheduleAction::AdjustFocus { .. } => "adjust_focus",
            ScheduleAction::Shutdown => "shutdown",
            ScheduleAction::WaitFor { .. } => "wait_for",
            ScheduleAction::WaitUntil { .. } => "wait_until",
            ScheduleAction::StartUpSequence(_) => "start_up_sequence",
            ScheduleAction::SetDewHeater { .. } => "action_set_dew_heater",
            ScheduleAction::SetExposure { .. } => "action_set_exposure",
            ScheduleAction::Passthrough { method, .. } => method,
        }
    }

    fn params(&self) -> Option<Value> {
        let value = match self {
            ScheduleAction::StartMosaic(mosaic) => to_value(mosaic),
            ScheduleAction::StartSpectra(spectra) => to_value(spectra),
            ScheduleAction::AutoFocus { try_count } => json!({ "try_count": try_count }),
            ScheduleAction::AdjustFocus { steps } => json!({ "steps": steps }),
            ScheduleAction::Shutdown => return None,
            ScheduleAction::WaitFor { timer_sec } => json!({ "timer_sec": timer_sec }),
            ScheduleAction::WaitUntil { local_time } => {
                json!({ "local_time": local_time.format("%H:%M").to_string() })
            }
            ScheduleAction::StartUpSequence(startup) => to_value(startup),
            ScheduleAction::SetDewHeater { heater } => json!({ "heater": heater }),
            ScheduleAction::SetExposure { exp } => json!({ "exp": exp }),
            ScheduleAction::Passthrough { params, .. } => return params.clone(),
        };
        Some(value)
    }

    fn parse(action: &str, params: Option<Value>) -> SchedulerResult<Self> {
        let parsed = match action {
            "start_mosaic" => ScheduleAction::StartMosaic(typed(action, params)?),
            "start_spectra" => ScheduleAction::StartSpectra(typed(action, params)?),
            "auto_focus" => {
                let p: TryCountParams = typed_or_default(action, params)?;
                ScheduleAction::AutoFocus {
                    try_count: p.try_count,
                }
            }
            "adjust_focus" => {
                let p: StepsParams = typed(action, params)?;
                ScheduleAction::AdjustFocus { steps: p.steps }
            }
            "shutdown" => ScheduleAction::Shutdown,
            "wait_for" => {
                let p: TimerParams = typed(action, params)?;
                ScheduleAction::WaitFor {
                    timer_sec: p.timer_sec,
                }
            }
            "wait_until" => {
                let p: LocalTimeParams = typed(action, params)?;
                let local_time = NaiveTime::parse_from_str(p.local_time.trim(), "%H:%M")
                    .map_err(|e| {
                        SchedulerError::InvalidItem(format!(
                            "wait_until local_time '{}': {}",
                            p.local_time, e
                        ))
                    })?;
                ScheduleAction::WaitUntil { local_time }
            }
            "start_up_sequence" => ScheduleAction::StartUpSequence(typed_or_default(action, params)?),
            "action_set_dew_heater" => {
                let p: HeaterParams = typed(action, params)?;
                ScheduleAction::SetDewHeater { heater: p.heater }
            }
            "action_set_exposure" => {
                let p: ExposureParams = typed(action, params)?;
                ScheduleAction::SetExposure { exp: p.exp }
            }
            "" => return Err(SchedulerError::InvalidItem("missing action".to_string())),
            other => ScheduleAction::Passthrough {
                method: other.to_string(),
                params,
            },
        };
        Ok(parsed)
    }
}

fn to_value<T: Serialize>(params: &T) -> Value {
    serde_json::to_value(params).unwrap_or_default()
}

fn typed<T: DeserializeOwned>(action: &str, params: Option<Value>) -> SchedulerResult<T> {
    let params = params
        .ok_or_else(|| SchedulerError::InvalidItem(format!("{} needs params", action)))?;
    serde_json::from_value(params)
        .map_err(|e| SchedulerError::InvalidItem(format!("{}: {}", action, e)))
}

fn typed_or_default<T: DeserializeOwned>(action: &str, params: Option<Value>) -> SchedulerResult<T> {
    typed(action, Some(params.unwrap_or_else(|| json!({}))))
}

fn default_try_count() -> u32 {
    1
}

#[derive(Deserialize)]
struct TryCountParams {
    #[serde(default = "default_try_count")]
    try_count: u32,
}

#[derive(Deserialize)]
struct StepsParams {
    steps: i64,
}

#[derive(Deserialize)]
struct TimerParams {
    timer_sec: u64,
}

#[derive(Deserialize)]
struct LocalTimeParams {
    local_time: String,
}

#[derive(Deserialize)]
struct HeaterParams {
    heater: i64,
}

#[derive(Deserialize)]
struct ExposureParams {
    exp: u64,
}

/// Wire shape of an item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScheduleItem {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default)]
    pub schedule_item_id: String,
}

/// One entry of a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScheduleItem", into = "RawScheduleItem")]
pub struct ScheduleItem {
    pub id: String,
    pub action: ScheduleAction,
}

impl TryFrom<RawScheduleItem> for ScheduleItem {
    type Error = SchedulerError;

    fn try_from(raw: RawScheduleItem) -> Result<Self, Self::Error> {
        let action = ScheduleAction::parse(&raw.action, raw.params)?;
        let id = if raw.schedule_item_id.is_empty() {
            new_item_id()
        } else {
            raw.schedule_item_id
        };
        Ok(ScheduleItem { id, action })
    }
}

impl From<ScheduleItem> for RawScheduleItem {
    fn from(item: ScheduleItem) -> Self {
        RawScheduleItem {
            action: item.action.name().to_string(),
            params: item.action.params(),
            schedule_item_id: item.id,
        }
    }
}

pub(crate) fn new_item_id() -> String {
    Uuid::new_v4().to_string()
}

impl ScheduleItem {
    pub fn new(action: ScheduleAction) -> Self {
        Self {
            id: new_item_id(),
            action,
        }
    }

    /// Build an item from a `{action, params}` request
    ///
    /// The item always gets a fresh id, whatever the request carried.
    pub fn from_request(request: &Value) -> SchedulerResult<Self> {
        let raw: RawScheduleItem = serde_json::from_value(request.clone())
            .map_err(|e| SchedulerError::InvalidItem(e.to_string()))?;
        let action = ScheduleAction::parse(&raw.action, raw.params)?;
        Ok(Self::new(action))
    }

    /// Same content under a new id
    pub fn with_fresh_id(&self) -> Self {
        Self::new(self.action.clone())
    }

    /// Tidy user-entered mosaic coordinates
    ///
    /// Sexagesimal text keeps one decimal of seconds. A negative numeric RA
    /// means "here": it is replaced by `current` (JNow) when known. Numbers
    /// are rounded to 4 decimals.
    pub fn normalize_target(&mut self, current: Option<SkyPosition>) {
        let ScheduleAction::StartMosaic(item) = &mut self.action else {
            return;
        };
        let mosaic = &mut item.mosaic;
        match (&mosaic.ra, &mosaic.dec) {
            (CoordinateValue::Text(ra), CoordinateValue::Text(dec)) => {
                mosaic.ra = CoordinateValue::Text(trim_seconds(ra));
                mosaic.dec = CoordinateValue::Text(trim_seconds(dec));
            }
            (CoordinateValue::Number(ra), CoordinateValue::Number(dec)) => {
                let (mut ra, mut dec) = (*ra, *dec);
                if ra < 0.0 {
                    if let Some(position) = current {
                        ra = position.ra;
                        dec = position.dec;
                        mosaic.is_j2000 = false;
                    }
                }
                mosaic.ra = CoordinateValue::Number(round_to(ra, 4));
                mosaic.dec = CoordinateValue::Number(round_to(dec, 4));
            }
            _ => {}
        }
    }

    pub fn to_value(&self) -> Value {
        to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_actions_parse() {
        let item = ScheduleItem::from_request(&json!({
            "action": "wait_for",
            "params": {"timer_sec": 10}
        }))
        .unwrap();
        assert_eq!(item.action, ScheduleAction::WaitFor { timer_sec: 10 });

        let item = ScheduleItem::from_request(&json!({"action": "auto_focus"})).unwrap();
        assert_eq!(item.action, ScheduleAction::AutoFocus { try_count: 1 });

        let item = ScheduleItem::from_request(&json!({
            "action": "wait_until",
            "params": {"local_time": "23:45"}
        }))
        .unwrap();
        assert_eq!(
            item.action,
            ScheduleAction::WaitUntil {
                local_time: NaiveTime::from_hms_opt(23, 45, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_unknown_action_is_passthrough() {
        let item = ScheduleItem::from_request(&json!({
            "action": "scope_park",
            "params": {"equ_mode": true}
        }))
        .unwrap();
        assert_eq!(
            item.action,
            ScheduleAction::Passthrough {
                method: "scope_park".to_string(),
                params: Some(json!({"equ_mode": true}))
            }
        );
    }

    #[test]
    fn test_bad_params_rejected() {
        assert!(ScheduleItem::from_request(&json!({"action": "wait_for"})).is_err());
        assert!(ScheduleItem::from_request(&json!({
            "action": "wait_until",
            "params": {"local_time": "25:99"}
        }))
        .is_err());
        assert!(ScheduleItem::from_request(&json!({"params": {}})).is_err());
    }

    #[test]
    fn test_request_id_replaced() {
        let item = ScheduleItem::from_request(&json!({
            "action": "shutdown",
            "schedule_item_id": "caller-chosen"
        }))
        .unwrap();
        assert_ne!(item.id, "caller-chosen");
        assert!(Uuid::parse_str(&item.id).is_ok());
    }

    #[test]
    fn test_wire_shape_keeps_id_and_params() {
        let value = json!({
            "action": "start_mosaic",
            "params": {
                "target_name": "M31",
                "ra": "0h42m44.33s",
                "dec": "+41d16m7.5s",
                "panel_time_sec": 600,
                "ra_num": 2,
                "dec_num": 1,
                "federation_mode": "by_panel"
            },
            "schedule_item_id": "item-1"
        });
        let item: ScheduleItem = serde_json::from_value(value).unwrap();
        assert_eq!(item.id, "item-1");
        let ScheduleAction::StartMosaic(mosaic) = &item.action else {
            panic!("expected a mosaic, got {:?}", item.action);
        };
        assert_eq!(mosaic.federation_mode, Some(FederationMode::ByPanel));
        assert_eq!(mosaic.mosaic.ra_num, 2);

        let back = item.to_value();
        assert_eq!(back["action"], "start_mosaic");
        assert_eq!(back["schedule_item_id"], "item-1");
        assert_eq!(back["params"]["federation_mode"], "by_panel");
        assert_eq!(back["params"]["panel_time_sec"], 600);

        let again: ScheduleItem = serde_json::from_value(back).unwrap();
        assert_eq!(again, item);
    }

    #[test]
    fn test_normalize_numeric_target() {
        let mut item = ScheduleItem::from_request(&json!({
            "action": "start_mosaic",
            "params": {"target_name": "here", "ra": -1.0, "dec": -1.0}
        }))
        .unwrap();
        item.normalize_target(Some(SkyPosition {
            ra: 5.123456,
            dec: -12.987654,
        }));
        let ScheduleAction::StartMosaic(mosaic) = &item.action else {
            panic!("expected a mosaic");
        };
        assert_eq!(mosaic.mosaic.ra, CoordinateValue::Number(5.1235));
        assert_eq!(mosaic.mosaic.dec, CoordinateValue::Number(-12.9877));
        assert!(!mosaic.mosaic.is_j2000);
    }

    #[test]
    fn test_normalize_text_target() {
        let mut item = ScheduleItem::from_request(&json!({
            "action": "start_mosaic",
            "params": {"target_name": "M42", "ra": "5h35m17.345s", "dec": "-5d23m28.123s"}
        }))
        .unwrap();
        item.normalize_target(None);
        let ScheduleAction::StartMosaic(mosaic) = &item.action else {
            panic!("expected a mosaic");
        };
        assert_eq!(mosaic.mosaic.ra, CoordinateValue::from("5h35m17.3s"));
        assert_eq!(mosaic.mosaic.dec, CoordinateValue::from("-5d23m28.1s"));
        assert!(mosaic.mosaic.is_j2000);
    }
}
