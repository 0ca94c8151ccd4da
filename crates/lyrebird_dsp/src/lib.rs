//! Lyrebird DSP - Stereo Signal Processing
//!
//! This crate holds the pure signal-processing stages of the Lyrebird
//! pipeline:
//! - Stereo channel separation with a pool-free fallback path
//! - FFT cross-correlation channel synchronization with content gating
//! - Per-channel quality scoring (crest / level / clip / noise)
//! - Adaptive sync windowing and EMA load gating
//!
//! Everything here operates on plain slices; buffer ownership, pooling and
//! threading live in `lyrebird_core`. That keeps this crate deterministic
//! and testable without any runtime scaffolding.

mod error;
mod history;
mod load;
mod processor;
mod quality;
mod separation;
mod sync;
mod window;

pub use error::{DspError, DspResult};
pub use history::{History, DEFAULT_HISTORY_LEN};
pub use load::{LoadTracker, DEFAULT_LOAD_THRESHOLD};
pub use processor::{FrameReport, ProcessorConfig, SignalProcessor};
pub use quality::{analyze, score_samples, AudioStats, QualityBreakdown};
pub use separation::{
    decode_samples, encode_samples, fallback_split, interleave, split_into, BYTES_PER_FRAME,
    BYTES_PER_SAMPLE,
};
pub use sync::{ChannelSync, SyncConfig, SyncOutcome};
pub use window::{AdaptiveWindow, DEFAULT_WINDOW, MAX_WINDOW, MIN_WINDOW};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _processor = SignalProcessor::new(ProcessorConfig::default());
        let _sync = ChannelSync::new(SyncConfig::default());
    }
}
