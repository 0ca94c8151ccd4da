//! Lyrebird Platform - External Interfaces
//!
//! The pipeline's two external collaborators live behind traits here:
//!
//! - [`CaptureSource`]: pull-mode stereo frames from a host OS loopback /
//!   virtual-cable device (CPAL implementation) or from the deterministic
//!   [`SimulatedSource`] used by tests and offline runs.
//! - [`TranscriptionClient`]: the remote speech-to-text submission
//!   contract, with its token-bucket rate limiter and retry policy.
//!
//! Nothing in this crate owns pipeline state; it is the boundary layer the
//! coordination core drives.

mod capture;
mod error;
mod sim;
mod traits;
mod transcribe;

pub use capture::{CaptureConfig, CpalLoopbackSource};
pub use error::{CaptureError, PlatformError};
pub use sim::{SimConfig, SimulatedSource};
pub use traits::{CaptureSource, DeviceAction, DeviceEvent, StereoFrame};
pub use transcribe::{
    submit_with_retry, FixedTranscriptionClient, RetryPolicy, TokenBucket, TranscribeError,
    TranscriptSegment, TranscriptionClient, TranscriptionRequest, TranscriptionResult,
};
