//! Passive reactions to device events
//!
//! Callbacks see every event whose name they subscribe to and may ask the
//! session to act. They never call back into the device themselves, which
//! keeps the receiver task free of blocking round trips.

use crate::protocol::events;
use serde_json::Value;
use tracing::{info, warn};

/// Something a callback wants the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    /// Park and power the device off
    Shutdown { reason: String },
}

/// Reaction to a subset of device events
pub trait EventCallback: Send + Sync {
    /// Event names this callback wants to see
    fn fire_on_events(&self) -> &[&'static str];

    /// Handle one event, returning any actions to perform
    fn event_fired(&mut self, event: &Value) -> Vec<CallbackAction>;
}

/// Shuts the device down when the battery runs low on discharge
pub struct BatteryWatch {
    low_limit: i64,
    discharging: bool,
    charge_online: bool,
    battery_capacity: i64,
    triggered: bool,
}

impl BatteryWatch {
    /// Seed from the `pi_status` block of `get_device_state`, if available
    pub fn new(low_limit: i64, initial_state: Option<&Value>) -> Self {
        let pi_status = initial_state.and_then(|s| s.get("pi_status"));
        let discharging = pi_status
            .and_then(|p| p.get("charger_status"))
            .and_then(Value::as_str)
            .map(|s| s == "Discharging")
            .unwrap_or(false);
        let charge_online = pi_status
            .and_then(|p| p.get("charge_online"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let battery_capacity = pi_status
            .and_then(|p| p.get("battery_capacity"))
            .and_then(Value::as_i64)
            .unwrap_or(100);

        info!("BatteryWatch - init at {}%", battery_capacity);
        Self {
            low_limit,
            discharging,
            charge_online,
            battery_capacity,
            triggered: false,
        }
    }
}

impl EventCallback for BatteryWatch {
    fn fire_on_events(&self) -> &[&'static str] {
        &[events::PI_STATUS]
    }

    fn event_fired(&mut self, event: &Value) -> Vec<CallbackAction> {
        if let Some(status) = event.get("charger_status").and_then(Value::as_str) {
            self.discharging = status == "Discharging";
        }
        if let Some(online) = event.get("charge_online").and_then(Value::as_bool) {
            self.charge_online = online;
        }
        if let Some(capacity) = event.get("battery_capacity").and_then(Value::as_i64) {
            self.battery_capacity = capacity;
        }

        if self.discharging
            && !self.charge_online
            && self.battery_capacity <= self.low_limit
            && !self.triggered
        {
            self.triggered = true;
            info!("BatteryWatch: Shutting down due to battery capacity lower limit reached");
            return vec![CallbackAction::Shutdown {
                reason: format!("battery at {}%", self.battery_capacity),
            }];
        }
        Vec::new()
    }
}

/// Warns when the sensor temperature drifts far enough to invalidate darks
pub struct SensorTempWatch {
    max_change: f64,
    baseline: Option<f64>,
    triggered: bool,
}

impl SensorTempWatch {
    pub fn new(max_change: f64, initial_state: Option<&Value>) -> Self {
        let baseline = initial_state
            .and_then(|s| s.get("pi_status"))
            .and_then(|p| p.get("temp"))
            .and_then(Value::as_f64);
        Self {
            max_change,
            baseline,
            triggered: false,
        }
    }
}

impl EventCallback for SensorTempWatch {
    fn fire_on_events(&self) -> &[&'static str] {
        &[events::PI_STATUS]
    }

    fn event_fired(&mut self, event: &Value) -> Vec<CallbackAction> {
        let Some(temp) = event.get("temp").and_then(Value::as_f64) else {
            return Vec::new();
        };
        let baseline = *self.baseline.get_or_insert(temp);
        if (baseline - temp).abs() > self.max_change && !self.triggered {
            warn!(
                "SensorTempWatch: temp changed more than {} degrees ({} -> {})",
                self.max_change, baseline, temp
            );
            self.triggered = true;
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_battery_watch_triggers_once() {
        let mut watch = BatteryWatch::new(3, None);
        assert!(watch
            .event_fired(&json!({"Event": "PiStatus", "battery_capacity": 2}))
            .is_empty());

        let actions = watch.event_fired(&json!({
            "Event": "PiStatus",
            "charger_status": "Discharging",
            "charge_online": false,
            "battery_capacity": 3
        }));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], CallbackAction::Shutdown { .. }));

        assert!(watch
            .event_fired(&json!({"Event": "PiStatus", "battery_capacity": 1}))
            .is_empty());
    }

    #[test]
    fn test_battery_watch_ignores_when_charging() {
        let initial = json!({"pi_status": {"charger_status": "Charging", "charge_online": true, "battery_capacity": 50}});
        let mut watch = BatteryWatch::new(3, Some(&initial));
        let actions = watch.event_fired(&json!({"Event": "PiStatus", "battery_capacity": 1}));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_sensor_temp_watch_never_acts() {
        let mut watch = SensorTempWatch::new(6.0, None);
        assert!(watch.event_fired(&json!({"temp": 20.0})).is_empty());
        assert!(watch.event_fired(&json!({"temp": 30.0})).is_empty());
        assert!(watch.triggered);
    }
}
