//! Seestar device error types
//!
//! Transport faults never surface through these types; the transport degrades
//! them to `false`/`None` and self-heals. These errors cover the places where a
//! caller genuinely needs to stop: bad configuration, file I/O, JSON that must
//! parse, and strict operations issued without a connection.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the device session
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Connection to {host}:{port} timed out after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to device {0}")]
    NotConnected(String),

    #[error("Invalid coordinate '{input}': {reason}")]
    InvalidCoordinate { input: String, reason: String },

    #[error("Invalid frame header: {0}")]
    InvalidFrame(String),

    #[error("Device reported error for {method}: {message}")]
    DeviceReported { method: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Whether retrying the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::ConnectionTimeout { .. } => true,
            DeviceError::ConnectionFailed(_) => true,
            DeviceError::NotConnected(_) => true,
            DeviceError::Io(_) => true,
            DeviceError::InvalidCoordinate { .. } => false,
            DeviceError::InvalidFrame(_) => false,
            DeviceError::DeviceReported { .. } => false,
            DeviceError::Config(_) => false,
            DeviceError::Json(_) => false,
        }
    }
}

impl From<toml::de::Error> for DeviceError {
    fn from(err: toml::de::Error) -> Self {
        DeviceError::Config(err.to_string())
    }
}

impl From<DeviceError> for String {
    fn from(err: DeviceError) -> String {
        err.to_string()
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::ConnectionTimeout {
            host: "192.168.1.100".to_string(),
            port: 4700,
            duration: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("192.168.1.100"));
        assert!(msg.contains("4700"));

        let err = DeviceError::InvalidCoordinate {
            input: "25h00m".to_string(),
            reason: "hours out of range".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid coordinate '25h00m': hours out of range"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DeviceError::NotConnected("Seestar Alpha".into()).is_retryable());
        assert!(DeviceError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!DeviceError::Config("bad port".into()).is_retryable());
        assert!(!DeviceError::InvalidFrame("short".into()).is_retryable());
    }

    #[test]
    fn test_error_to_string_conversion() {
        let err = DeviceError::NotConnected("Seestar Alpha".into());
        let s: String = err.into();
        assert_eq!(s, "Not connected to device Seestar Alpha");
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err: DeviceError = toml::from_str::<toml::Value>("= broken")
            .unwrap_err()
            .into();
        assert!(matches!(err, DeviceError::Config(_)));
    }
}
