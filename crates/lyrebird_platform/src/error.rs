//! Platform Error Types

use thiserror::Error;

/// Errors from platform capture backends
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("no capture devices found")]
    NoDevicesFound,

    #[error("capture device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to build capture stream: {0}")]
    StreamBuildError(String),

    #[error("failed to start capture stream: {0}")]
    StreamPlayError(String),

    #[error("capture source already running")]
    AlreadyRunning,

    #[error("capture backend thread died during startup")]
    StartupFailed,
}

/// Per-read failures reported by a capture source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No full frame arrived within the timeout
    #[error("timed out waiting for a capture frame")]
    TimedOut,

    /// The source finished (end of simulated input, device drained)
    #[error("capture source reached end of stream")]
    Eos,

    /// The device vanished or the stream failed; recovery required
    #[error("capture device lost: {0}")]
    DeviceLost(String),

    /// The source is not running
    #[error("capture source is not active")]
    NotActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(PlatformError::DeviceNotFound("cable".into())
            .to_string()
            .contains("cable"));
        assert!(CaptureError::DeviceLost("unplugged".into())
            .to_string()
            .contains("unplugged"));
    }
}
