//! Capture Source Interface
//!
//! The pipeline pulls stereo frames from whatever feeds it - a loopback or
//! virtual-cable device through CPAL in production, a deterministic
//! generator in tests. Device hot-plug is surfaced as events on a channel
//! the engine can poll alongside its own.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, PlatformError};

/// One interleaved stereo frame of 16-bit LE PCM
#[derive(Debug, Clone)]
pub struct StereoFrame {
    /// Interleaved samples: `L0 R0 L1 R1 ...`
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl StereoFrame {
    /// Samples per channel in this frame
    pub fn samples_per_channel(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Frame duration derived from length and rate
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel() as f64 / self.sample_rate as f64)
    }
}

/// Device hot-plug action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAction {
    Added,
    Removed,
}

/// Device hot-plug notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub device_id: String,
}

/// Pull-mode stereo capture source
///
/// Implementations run their own capture machinery (audio callbacks,
/// generators); the pipeline's capture worker drives `read_frame` in a
/// loop with a bounded timeout so shutdown stays responsive.
pub trait CaptureSource: Send {
    /// Backend name for logs and diagnostics
    fn name(&self) -> &str;

    /// Start delivering frames. Idempotent errors with `AlreadyRunning`.
    fn start(&mut self) -> Result<(), PlatformError>;

    /// Stop delivering frames and release the device.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Pull the next full frame, waiting up to `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<StereoFrame, CaptureError>;

    /// Hot-plug events for this source's devices.
    fn events(&self) -> Receiver<DeviceEvent>;
}
