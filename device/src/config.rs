//! Configuration for Seestar sessions
//!
//! Loaded from TOML. Every section has defaults so a config file only needs to
//! name the telescopes it talks to.

use crate::error::{DeviceError, DeviceResult};
use crate::{DEFAULT_CONTROL_PORT, DEFAULT_IMAGING_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeestarConfig {
    pub site: SiteConfig,
    pub imaging: ImagingConfig,
    pub timeouts: SessionTimeoutConfig,
    pub reconnect: ReconnectConfig,
    #[serde(rename = "seestars")]
    pub devices: Vec<DeviceConfig>,
}

impl SeestarConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(text: &str) -> DeviceResult<Self> {
        let config: SeestarConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> DeviceResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> DeviceResult<()> {
        if !(-90.0..=90.0).contains(&self.site.latitude) {
            return Err(DeviceError::Config(format!(
                "site latitude {} out of range",
                self.site.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.site.longitude) {
            return Err(DeviceError::Config(format!(
                "site longitude {} out of range",
                self.site.longitude
            )));
        }
        for device in &self.devices {
            if device.ip_address.trim().is_empty() {
                return Err(DeviceError::Config(format!(
                    "device '{}' has no ip_address",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

/// One telescope entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub imaging_port: u16,
    /// Index used by front-ends to address the device
    pub device_num: u32,
    /// Mounted on an equatorial wedge
    pub is_eq_mode: bool,
    /// Send the UDP `scan_iscope` intro before the first connect
    pub send_udp_intro: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Seestar".to_string(),
            ip_address: "seestar.local".to_string(),
            port: DEFAULT_CONTROL_PORT,
            imaging_port: DEFAULT_IMAGING_PORT,
            device_num: 1,
            is_eq_mode: false,
            send_udp_intro: true,
        }
    }
}

/// Observing site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// IANA zone name reported to the device with `pi_set_time`
    pub time_zone: Option<String>,
    /// Margin in degrees above the lowest declination the device accepts in EQ mode
    pub below_horizon_margin_deg: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            time_zone: None,
            below_horizon_margin_deg: 20.0,
        }
    }
}

/// Base imaging settings applied at start-up and by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub gain: i64,
    pub exposure_stack_ms: u64,
    pub exposure_continuous_ms: u64,
    pub stack_after_goto: bool,
    pub auto_af: bool,
    pub dither_enabled: bool,
    pub dither_length_pixel: u32,
    pub dither_frequency: u32,
    pub activate_lp_filter: bool,
    pub dbe_enabled: bool,
    pub frame_calibrated: bool,
    pub dew_heater_power: i64,
    pub save_good_frames: bool,
    pub save_all_frames: bool,
    /// Claim master control on connect
    pub guest_mode_init: bool,
    /// Battery percentage at which the device is parked and shut down
    pub battery_low_limit: i64,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            gain: 80,
            exposure_stack_ms: 10_000,
            exposure_continuous_ms: 500,
            stack_after_goto: false,
            auto_af: false,
            dither_enabled: true,
            dither_length_pixel: 50,
            dither_frequency: 10,
            activate_lp_filter: false,
            dbe_enabled: false,
            frame_calibrated: true,
            dew_heater_power: 0,
            save_good_frames: true,
            save_all_frames: false,
            guest_mode_init: true,
            battery_low_limit: 3,
        }
    }
}

/// Timeouts and polling cadence for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeoutConfig {
    /// TCP connect timeout (default: 5 seconds)
    pub connect_timeout_secs: u64,
    /// Socket read timeout; an idle read returns nothing after this (default: 10 seconds)
    pub read_timeout_secs: u64,
    /// Wall-clock limit for a synchronous command (default: 10 seconds)
    pub sync_command_timeout_secs: u64,
    /// Response cache polling interval (default: 500ms)
    pub sync_poll_interval_ms: u64,
    /// Elapsed time after which a sync command logs a slow warning (default: 2 seconds)
    pub slow_warning_secs: u64,
    /// Event state polling interval for operation waits (default: 1 second)
    pub event_poll_interval_ms: u64,
    /// Goto completion limit (default: 300 seconds)
    pub goto_timeout_secs: u64,
    /// Auto-focus completion limit (default: 300 seconds)
    pub auto_focus_timeout_secs: u64,
    /// 3-point polar alignment completion limit (default: 600 seconds)
    pub polar_align_timeout_secs: u64,
    /// Dark library completion limit (default: 900 seconds)
    pub dark_frame_timeout_secs: u64,
    /// Single plate-solve completion limit (default: 60 seconds)
    pub plate_solve_timeout_secs: u64,
    /// Park completion limit (default: 180 seconds)
    pub park_timeout_secs: u64,
}

impl Default for SessionTimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            sync_command_timeout_secs: 10,
            sync_poll_interval_ms: 500,
            slow_warning_secs: 2,
            event_poll_interval_ms: 1000,
            goto_timeout_secs: 300,
            auto_focus_timeout_secs: 300,
            polar_align_timeout_secs: 600,
            dark_frame_timeout_secs: 900,
            plate_solve_timeout_secs: 60,
            park_timeout_secs: 180,
        }
    }
}

impl SessionTimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn sync_command_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_command_timeout_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn slow_warning(&self) -> Duration {
        Duration::from_secs(self.slow_warning_secs)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn goto_timeout(&self) -> Duration {
        Duration::from_secs(self.goto_timeout_secs)
    }

    pub fn auto_focus_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_focus_timeout_secs)
    }

    pub fn polar_align_timeout(&self) -> Duration {
        Duration::from_secs(self.polar_align_timeout_secs)
    }

    pub fn dark_frame_timeout(&self) -> Duration {
        Duration::from_secs(self.dark_frame_timeout_secs)
    }

    pub fn plate_solve_timeout(&self) -> Duration {
        Duration::from_secs(self.plate_solve_timeout_secs)
    }

    pub fn park_timeout(&self) -> Duration {
        Duration::from_secs(self.park_timeout_secs)
    }
}

/// Liveness and reconnection cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Heartbeat period while connected (default: 3 seconds)
    pub heartbeat_interval_secs: u64,
    /// Wait after a failed reconnect before the next tick (default: 5 seconds)
    pub reconnect_wait_secs: u64,
    /// Backoff after a failed connect inside `reconnect()` (default: 100ms)
    pub reconnect_backoff_ms: u64,
    /// How long the UDP intro waits for replies (default: 1 second)
    pub discovery_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 3,
            reconnect_wait_secs: 5,
            reconnect_backoff_ms: 100,
            discovery_timeout_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}
