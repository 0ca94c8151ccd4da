//! Per-frame Signal Processing
//!
//! Drives one stereo frame through separation, channel synchronization and
//! quality scoring. The processor is buffer-pool agnostic: callers hand in
//! the input frame and two output buffers (typically pool allocations) and
//! get back how many bytes of each are valid. Load gating decides when to
//! shed the sync and quality stages and fall back to the plain split.

use std::time::Instant;

use crate::error::DspResult;
use crate::load::{LoadTracker, DEFAULT_LOAD_THRESHOLD};
use crate::quality::{analyze, AudioStats};
use crate::separation::{decode_samples, encode_samples, split_into};
use crate::sync::{ChannelSync, SyncConfig, SyncOutcome};
use crate::window::AdaptiveWindow;

/// Processor tuning parameters
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Sample rate of the capture stream, Hz
    pub sample_rate: u32,
    /// Queue depth above which the processor sheds load
    pub max_queue_depth: usize,
    /// EMA load threshold for entering recovery mode
    pub load_threshold: f64,
    /// Channel synchronization parameters
    pub sync: SyncConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_queue_depth: 1024,
            load_threshold: DEFAULT_LOAD_THRESHOLD,
            sync: SyncConfig::default(),
        }
    }
}

/// Outcome of processing one stereo frame
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Valid bytes in the left output buffer
    pub left_len: usize,
    /// Valid bytes in the right output buffer
    pub right_len: usize,
    /// Per-channel stats; `None` on the degraded path
    pub stats: Option<(AudioStats, AudioStats)>,
    /// Alignment applied to this frame, if any
    pub sync: Option<SyncOutcome>,
    /// True when the frame took the reduced-work path
    pub degraded: bool,
    /// Sync window used for this frame, samples
    pub window: usize,
    /// Wall time spent processing, milliseconds
    pub processing_ms: f64,
}

/// Stateful per-frame processor
pub struct SignalProcessor {
    config: ProcessorConfig,
    sync: ChannelSync,
    window: AdaptiveWindow,
    load: LoadTracker,
    frames_processed: u64,
}

impl SignalProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            sync: ChannelSync::new(config.sync),
            window: AdaptiveWindow::new(),
            load: LoadTracker::new(config.load_threshold),
            config,
            frames_processed: 0,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process one interleaved stereo frame into the two channel buffers.
    ///
    /// `queue_depth` is the current processing-queue backlog, used for load
    /// gating. On the degraded path the outputs still receive the plain
    /// channel split (identical bytes to the full path for well-formed
    /// input) but sync and quality are skipped.
    pub fn process_frame(
        &mut self,
        input: &[u8],
        queue_depth: usize,
        left_out: &mut [u8],
        right_out: &mut [u8],
    ) -> DspResult<FrameReport> {
        let start = Instant::now();
        let window = self.window.window();

        let channel_len = split_into(input, left_out, right_out)?;

        if self.load.should_degrade(queue_depth, self.config.max_queue_depth) {
            let processing_ms = elapsed_ms(start);
            self.load.record_frame(processing_ms);
            self.frames_processed += 1;
            return Ok(FrameReport {
                left_len: channel_len,
                right_len: channel_len,
                stats: None,
                sync: None,
                degraded: true,
                window,
                processing_ms,
            });
        }

        let mut left = decode_samples(&left_out[..channel_len]);
        let mut right = decode_samples(&right_out[..channel_len]);

        let sync_outcome = self.sync.align(&mut left, &mut right, window);
        let (left_len, right_len) = if sync_outcome.is_some() {
            // Alignment trims both channels; rewrite the shifted samples
            let l = encode_samples(&left, left_out)?;
            let r = encode_samples(&right, right_out)?;
            (l, r)
        } else {
            (channel_len, channel_len)
        };

        let stage_ms = elapsed_ms(start);
        let left_stats = analyze(&left, stage_ms);
        let right_stats = analyze(&right, stage_ms);

        let processing_ms = elapsed_ms(start);
        self.window.record(processing_ms);
        self.load.record_frame(processing_ms);
        self.frames_processed += 1;

        Ok(FrameReport {
            left_len,
            right_len,
            stats: Some((left_stats, right_stats)),
            sync: sync_outcome,
            degraded: false,
            window,
            processing_ms,
        })
    }

    /// Current adaptive sync window, samples
    pub fn sync_window(&self) -> usize {
        self.window.window()
    }

    /// Current EMA processing load
    pub fn load(&self) -> f64 {
        self.load.load()
    }

    pub fn is_recovering(&self) -> bool {
        self.load.is_recovering()
    }

    pub fn recovery_count(&self) -> u64 {
        self.load.recovery_count()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Clear all rolling state (used between capture sessions)
    pub fn reset(&mut self) {
        self.window.reset();
        self.load.reset();
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
