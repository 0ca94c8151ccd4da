//! Simulated Capture Source
//!
//! Deterministic multi-tone generator implementing [`CaptureSource`] for
//! tests and `--simulate` runs. Supports a configurable inter-channel
//! delay (the right channel lags), an optional frame budget that ends the
//! stream with `Eos`, and optional real-time pacing.

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{CaptureError, PlatformError};
use crate::traits::{CaptureSource, DeviceEvent, StereoFrame};

/// Simulated source configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub sample_rate: u32,
    /// Samples per channel per frame
    pub frame_samples: usize,
    /// Right channel lags the left by this many samples
    pub right_delay_samples: usize,
    /// Stop with `Eos` after this many frames; `None` runs forever
    pub frame_budget: Option<u64>,
    /// Sleep one frame duration per read, mimicking a real device
    pub realtime: bool,
    /// Peak amplitude, 0..1
    pub amplitude: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 480,
            right_delay_samples: 0,
            frame_budget: None,
            realtime: false,
            amplitude: 0.5,
        }
    }
}

/// Tones mixed into the generated signal (Hz, relative amplitude)
const TONES: [(f32, f32); 3] = [(30.0, 0.5), (220.0, 0.3), (445.0, 0.2)];

/// Deterministic stereo signal generator
pub struct SimulatedSource {
    config: SimConfig,
    active: bool,
    position: u64,
    frames_emitted: u64,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
}

impl SimulatedSource {
    pub fn new(config: SimConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            active: false,
            position: 0,
            frames_emitted: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Push a synthetic hot-plug event, for exercising device handling.
    pub fn inject_device_event(&self, event: DeviceEvent) {
        let _ = self.events_tx.send(event);
    }

    fn sample_at(&self, index: u64) -> i16 {
        let t = index as f32 / self.config.sample_rate as f32;
        let v: f32 = TONES
            .iter()
            .map(|&(freq, amp)| amp * (2.0 * std::f32::consts::PI * freq * t).sin())
            .sum();
        (v * self.config.amplitude * i16::MAX as f32) as i16
    }
}

impl CaptureSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        if self.active {
            return Err(PlatformError::AlreadyRunning);
        }
        self.active = true;
        self.position = 0;
        self.frames_emitted = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn read_frame(&mut self, _timeout: Duration) -> Result<StereoFrame, CaptureError> {
        if !self.active {
            return Err(CaptureError::NotActive);
        }
        if let Some(budget) = self.config.frame_budget {
            if self.frames_emitted >= budget {
                return Err(CaptureError::Eos);
            }
        }

        let delay = self.config.right_delay_samples as u64;
        let mut bytes = Vec::with_capacity(self.config.frame_samples * 4);
        for i in 0..self.config.frame_samples as u64 {
            let n = self.position + i;
            // Left leads; the right channel replays the signal `delay`
            // samples behind (silence before the stream began).
            let left = self.sample_at(n + delay);
            let right = self.sample_at(n);
            bytes.extend_from_slice(&left.to_le_bytes());
            bytes.extend_from_slice(&right.to_le_bytes());
        }
        self.position += self.config.frame_samples as u64;
        self.frames_emitted += 1;

        if self.config.realtime {
            std::thread::sleep(Duration::from_secs_f64(
                self.config.frame_samples as f64 / self.config.sample_rate as f64,
            ));
        }

        Ok(StereoFrame {
            bytes,
            sample_rate: self.config.sample_rate,
            captured_at: Instant::now(),
        })
    }

    fn events(&self) -> Receiver<DeviceEvent> {
        self.events_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DeviceAction;

    #[test]
    fn test_deterministic_frames() {
        let mut a = SimulatedSource::new(SimConfig::default());
        let mut b = SimulatedSource::new(SimConfig::default());
        a.start().unwrap();
        b.start().unwrap();

        let fa = a.read_frame(Duration::ZERO).unwrap();
        let fb = b.read_frame(Duration::ZERO).unwrap();
        assert_eq!(fa.bytes, fb.bytes);
        assert_eq!(fa.samples_per_channel(), 480);
    }

    #[test]
    fn test_frame_budget_ends_with_eos() {
        let mut source = SimulatedSource::new(SimConfig {
            frame_budget: Some(3),
            ..Default::default()
        });
        source.start().unwrap();
        for _ in 0..3 {
            source.read_frame(Duration::ZERO).unwrap();
        }
        assert!(matches!(
            source.read_frame(Duration::ZERO),
            Err(CaptureError::Eos)
        ));
        assert_eq!(source.frames_emitted(), 3);
    }

    #[test]
    fn test_right_channel_lags() {
        let delay = 100usize;
        let mut source = SimulatedSource::new(SimConfig {
            right_delay_samples: delay,
            ..Default::default()
        });
        source.start().unwrap();

        let first = source.read_frame(Duration::ZERO).unwrap();
        let second = source.read_frame(Duration::ZERO).unwrap();
        let all: Vec<u8> = first.bytes.iter().chain(second.bytes.iter()).copied().collect();

        // right[n] must equal left[n - delay]
        let samples: Vec<i16> = all
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let left: Vec<i16> = samples.iter().step_by(2).copied().collect();
        let right: Vec<i16> = samples.iter().skip(1).step_by(2).copied().collect();
        for n in delay..left.len() {
            assert_eq!(right[n], left[n - delay], "mismatch at {n}");
        }
    }

    #[test]
    fn test_not_active_before_start() {
        let mut source = SimulatedSource::new(SimConfig::default());
        assert!(matches!(
            source.read_frame(Duration::ZERO),
            Err(CaptureError::NotActive)
        ));
    }

    #[test]
    fn test_injected_events_delivered() {
        let source = SimulatedSource::new(SimConfig::default());
        let events = source.events();
        source.inject_device_event(DeviceEvent {
            action: DeviceAction::Added,
            device_id: "virtual-cable".into(),
        });
        let event = events.try_recv().unwrap();
        assert_eq!(event.action, DeviceAction::Added);
    }
}
