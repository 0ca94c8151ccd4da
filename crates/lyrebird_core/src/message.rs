//! Pipeline Events and Segments
//!
//! Events flow from the workers to whoever drives the engine (the CLI
//! shell, tests). Segments are the owned audio spans handed to the
//! transcription worker once a channel has accumulated enough material.

use lyrebird_platform::DeviceEvent;

use crate::pool::ChannelSide;

/// Events emitted by the pipeline workers
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Engine started successfully
    Started,

    /// Engine stopped
    Stopped,

    /// The capture source reached end of stream
    CaptureEnded,

    /// A frame took the reduced-work path
    DegradedFallback { reason: String },

    /// Channel alignment was applied to a frame
    SyncApplied { offset: isize, correlation: f32 },

    /// A queue rejected an element under pressure
    QueueOverflow { queue: String },

    /// A capture frame was dropped (pool exhausted or queue closed)
    FrameDropped { reason: String },

    /// Device hot-plug activity from the capture source
    Device(DeviceEvent),

    /// A segment came back from the transcription service
    TranscriptionReady {
        channel: ChannelSide,
        text: String,
        confidence: f32,
    },

    /// Recovery was triggered by repeated errors
    RecoveryStarted,

    /// Recovery finished
    RecoveryCompleted { success: bool },

    /// An error was recorded for a component
    Error { component: String, message: String },
}

/// One channel's accumulated audio span awaiting transcription
///
/// The audio is an owned copy; pool buffers never cross into the
/// transcription path.
#[derive(Debug, Clone)]
pub struct SpeakerSegment {
    pub channel: ChannelSide,
    /// Milliseconds since engine start
    pub start_ms: f64,
    pub end_ms: f64,
    /// 16-bit LE PCM, single channel
    pub audio: Vec<u8>,
    pub speaker_id: Option<String>,
}

impl SpeakerSegment {
    pub fn duration_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }
}

/// Accumulates per-channel audio until it spans the minimum duration
pub struct SegmentAssembler {
    channel: ChannelSide,
    sample_rate: u32,
    min_ms: f64,
    audio: Vec<u8>,
    start_ms: Option<f64>,
}

impl SegmentAssembler {
    pub fn new(channel: ChannelSide, sample_rate: u32, min_ms: f64) -> Self {
        Self {
            channel,
            sample_rate,
            min_ms,
            audio: Vec::new(),
            start_ms: None,
        }
    }

    fn accumulated_ms(&self) -> f64 {
        self.audio.len() as f64 / 2.0 / self.sample_rate as f64 * 1000.0
    }

    /// Append channel bytes observed at `now_ms`; returns a segment once
    /// the minimum duration is covered.
    pub fn push(&mut self, bytes: &[u8], now_ms: f64) -> Option<SpeakerSegment> {
        if bytes.is_empty() {
            return None;
        }
        if self.start_ms.is_none() {
            self.start_ms = Some(now_ms);
        }
        self.audio.extend_from_slice(bytes);

        if self.accumulated_ms() >= self.min_ms {
            return self.take();
        }
        None
    }

    /// Emit whatever is accumulated, provided it meets the minimum
    /// duration invariant. Shorter remainders are discarded.
    pub fn flush(&mut self) -> Option<SpeakerSegment> {
        if self.accumulated_ms() >= self.min_ms {
            self.take()
        } else {
            self.audio.clear();
            self.start_ms = None;
            None
        }
    }

    fn take(&mut self) -> Option<SpeakerSegment> {
        let start_ms = self.start_ms.take()?;
        let duration = self.accumulated_ms();
        let audio = std::mem::take(&mut self.audio);
        Some(SpeakerSegment {
            channel: self.channel,
            start_ms,
            end_ms: start_ms + duration,
            audio,
            speaker_id: None,
        })
    }
}
