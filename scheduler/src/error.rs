//! Scheduler error types
//!
//! Misuse of the scheduler (starting twice, editing an executed item) is not
//! an error here; it comes back as a non-zero `CommandResult` code. These
//! errors are for input that cannot be understood and for schedule files.

use seestar_device::DeviceError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid schedule item: {0}")]
    InvalidItem(String),

    #[error("Schedule item {0} not found")]
    ItemNotFound(String),

    #[error("Schedule file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl SchedulerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::File { .. } => true,
            SchedulerError::Device(e) => e.is_retryable(),
            SchedulerError::InvalidItem(_) => false,
            SchedulerError::ItemNotFound(_) => false,
            SchedulerError::Json(_) => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidItem("wait_for needs timer_sec".into());
        assert_eq!(
            err.to_string(),
            "Invalid schedule item: wait_for needs timer_sec"
        );

        let err = SchedulerError::File {
            path: PathBuf::from("/tmp/night.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/tmp/night.json"));
    }

    #[test]
    fn test_retryable_follows_device_error() {
        let err: SchedulerError = DeviceError::NotConnected("Seestar Alpha".into()).into();
        assert!(err.is_retryable());
        assert!(!SchedulerError::ItemNotFound("abc".into()).is_retryable());
    }
}
