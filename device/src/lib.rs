//! Seestar Remote-Control Session
//!
//! Talks to a ZWO Seestar smart telescope over its JSON-lines control port.
//!
//! ## Features
//!
//! - Per-device session context with its own id counter and caches
//! - Watch mode: receiver and heartbeat tasks with automatic reconnection
//! - Synchronous request/response correlation with bounded waits
//! - Event state store with cancellable waits on operation states
//! - High-level operations: goto with auto-centering, auto focus, dark
//!   frames, 3-point polar alignment, stacking, mosaics and spectra
//! - Below-horizon declination offset for EQ mounts
//! - UDP discovery and guest-mode control claims

pub mod callbacks;
pub mod config;
pub mod context;
pub mod coords;
pub mod correlator;
pub mod discovery;
pub mod error;
pub mod event_state;
pub mod framing;
pub mod ops;
pub mod protocol;
pub mod session;
pub mod transport;
mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callbacks::{BatteryWatch, CallbackAction, EventCallback, SensorTempWatch};
pub use config::{
    DeviceConfig, ImagingConfig, ReconnectConfig, SeestarConfig, SessionTimeoutConfig, SiteConfig,
};
pub use context::{ItemProgress, OperationContext, OperationOutcome};
pub use coords::CoordinateValue;
pub use discovery::{discover_devices, DiscoveredSeestar};
pub use error::{DeviceError, DeviceResult};
pub use event_state::{EventStateStore, WaitResult};
pub use ops::mosaic::{MosaicPanel, MosaicParams};
pub use ops::spectra::SpectraParams;
pub use ops::startup::StartupParams;
pub use protocol::{CommandResult, OpState};
pub use session::{SeestarSession, SkyPosition};
pub use transport::ConnectionEvent;

/// Control (JSON-lines) port
pub const DEFAULT_CONTROL_PORT: u16 = 4700;

/// Imaging (binary frame) port
pub const DEFAULT_IMAGING_PORT: u16 = 4800;

/// UDP port answering `scan_iscope`
pub const DEFAULT_DISCOVERY_PORT: u16 = 4720;

/// Responses kept for synchronous waiters
pub const RESPONSE_CACHE_CAPACITY: usize = 100;

/// Raw events kept for the live event stream
pub const EVENT_HISTORY_CAPACITY: usize = 20;

/// First command id handed out by a new session
pub const FIRST_COMMAND_ID: u64 = 10000;
