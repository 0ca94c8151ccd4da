//! CPAL Loopback Capture
//!
//! Captures from a loopback / virtual-cable / monitor input device via
//! CPAL. The real-time callback converts samples to i16 and pushes them
//! into a lock-free SPSC ring - no allocation, no locks on the audio
//! thread. A backend thread owns the CPAL stream (streams are not `Send`),
//! and `read_frame` assembles fixed-size frames from the ring with a
//! condvar-bounded wait.
//!
//! IMPORTANT: the device is expected to be a loopback or virtual sink
//! monitor carrying application audio, not a microphone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{error, info, warn};

use crate::error::{CaptureError, PlatformError};
use crate::traits::{CaptureSource, DeviceAction, DeviceEvent, StereoFrame};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device to open; `None` uses the default input device
    pub device_name: Option<String>,
    pub sample_rate: u32,
    /// Samples per channel in each delivered frame
    pub frame_samples: usize,
    /// Ring capacity in frames (headroom for a slow consumer)
    pub ring_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16_000,
            frame_samples: 480,
            ring_frames: 16,
        }
    }
}

struct SharedFlags {
    stop: AtomicBool,
    active: AtomicBool,
    lost: AtomicBool,
    overflows: AtomicU64,
}

/// Loopback capture source backed by a CPAL input stream
pub struct CpalLoopbackSource {
    config: CaptureConfig,
    flags: Arc<SharedFlags>,
    data_ready: Arc<(Mutex<()>, Condvar)>,
    consumer: Option<Consumer<i16>>,
    staging: Vec<i16>,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
    backend: Option<JoinHandle<()>>,
    lost_reason: Arc<Mutex<String>>,
}

impl CpalLoopbackSource {
    pub fn new(config: CaptureConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            flags: Arc::new(SharedFlags {
                stop: AtomicBool::new(false),
                active: AtomicBool::new(false),
                lost: AtomicBool::new(false),
                overflows: AtomicU64::new(0),
            }),
            data_ready: Arc::new((Mutex::new(()), Condvar::new())),
            consumer: None,
            staging: Vec::new(),
            events_tx,
            events_rx,
            backend: None,
            lost_reason: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Ring overflows observed since start (consumer fell behind)
    pub fn overflows(&self) -> u64 {
        self.flags.overflows.load(Ordering::Relaxed)
    }

    fn interleaved_per_frame(&self) -> usize {
        self.config.frame_samples * 2
    }
}

impl CaptureSource for CpalLoopbackSource {
    fn name(&self) -> &str {
        "cpal-loopback"
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        if self.flags.active.load(Ordering::SeqCst) {
            return Err(PlatformError::AlreadyRunning);
        }
        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.lost.store(false, Ordering::SeqCst);

        let ring_capacity = self.interleaved_per_frame() * self.config.ring_frames;
        let (producer, consumer) = RingBuffer::<i16>::new(ring_capacity);
        self.consumer = Some(consumer);
        self.staging.clear();

        let (startup_tx, startup_rx) = crossbeam_channel::bounded::<Result<(), PlatformError>>(1);
        let config = self.config.clone();
        let flags = Arc::clone(&self.flags);
        let data_ready = Arc::clone(&self.data_ready);
        let events_tx = self.events_tx.clone();
        let lost_reason = Arc::clone(&self.lost_reason);

        // CPAL streams are not Send; a dedicated thread owns the stream for
        // the lifetime of the capture.
        let handle = thread::Builder::new()
            .name("lyrebird-cpal".into())
            .spawn(move || {
                backend_main(config, producer, flags, data_ready, events_tx, lost_reason, startup_tx)
            })
            .map_err(|e| PlatformError::StreamBuildError(e.to_string()))?;
        self.backend = Some(handle);

        match startup_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                self.flags.active.store(true, Ordering::SeqCst);
                info!("cpal capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                if let Some(h) = self.backend.take() {
                    let _ = h.join();
                }
                Err(e)
            }
            Err(_) => {
                self.flags.stop.store(true, Ordering::SeqCst);
                if let Some(h) = self.backend.take() {
                    let _ = h.join();
                }
                Err(PlatformError::StartupFailed)
            }
        }
    }

    fn stop(&mut self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.backend.take() {
            let _ = handle.join();
        }
        self.flags.active.store(false, Ordering::SeqCst);
        self.consumer = None;
        info!("cpal capture stopped");
    }

    fn is_active(&self) -> bool {
        self.flags.active.load(Ordering::SeqCst)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<StereoFrame, CaptureError> {
        let needed = self.interleaved_per_frame();
        let deadline = Instant::now() + timeout;

        let consumer = self.consumer.as_mut().ok_or(CaptureError::NotActive)?;

        loop {
            while self.staging.len() < needed {
                match consumer.pop() {
                    Ok(sample) => self.staging.push(sample),
                    Err(_) => break,
                }
            }

            if self.staging.len() >= needed {
                let mut bytes = Vec::with_capacity(needed * 2);
                for sample in self.staging.drain(..needed) {
                    bytes.extend_from_slice(&sample.to_le_bytes());
                }
                return Ok(StereoFrame {
                    bytes,
                    sample_rate: self.config.sample_rate,
                    captured_at: Instant::now(),
                });
            }

            if self.flags.lost.load(Ordering::SeqCst) {
                return Err(CaptureError::DeviceLost(self.lost_reason.lock().clone()));
            }
            if self.flags.stop.load(Ordering::SeqCst) {
                return Err(CaptureError::Eos);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CaptureError::TimedOut);
            }
            let (lock, condvar) = &*self.data_ready;
            let mut guard = lock.lock();
            condvar.wait_for(&mut guard, (deadline - now).min(Duration::from_millis(50)));
        }
    }

    fn events(&self) -> Receiver<DeviceEvent> {
        self.events_rx.clone()
    }
}

impl Drop for CpalLoopbackSource {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn backend_main(
    config: CaptureConfig,
    mut producer: Producer<i16>,
    flags: Arc<SharedFlags>,
    data_ready: Arc<(Mutex<()>, Condvar)>,
    events_tx: Sender<DeviceEvent>,
    lost_reason: Arc<Mutex<String>>,
    startup_tx: Sender<Result<(), PlatformError>>,
) {
    let host = cpal::default_host();

    let device = match &config.device_name {
        Some(name) => {
            let found = host.input_devices().ok().and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            });
            match found {
                Some(d) => d,
                None => {
                    let _ = startup_tx.send(Err(PlatformError::DeviceNotFound(name.clone())));
                    return;
                }
            }
        }
        None => match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = startup_tx.send(Err(PlatformError::NoDevicesFound));
                return;
            }
        },
    };

    let device_id = device.name().unwrap_or_else(|_| "unknown".into());
    let stream_config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ready = Arc::clone(&data_ready);
    let overflow_flags = Arc::clone(&flags);
    let err_events = events_tx.clone();
    let err_flags = Arc::clone(&flags);
    let err_reason = Arc::clone(&lost_reason);
    let err_device = device_id.clone();
    let err_ready = Arc::clone(&data_ready);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            // Real-time audio callback - no allocation, no locks
            let mut dropped = false;
            for &sample in data {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                if producer.push(value).is_err() {
                    dropped = true;
                }
            }
            if dropped {
                overflow_flags.overflows.fetch_add(1, Ordering::Relaxed);
            }
            ready.1.notify_one();
        },
        move |err| {
            error!(error = %err, "capture stream failed");
            *err_reason.lock() = err.to_string();
            err_flags.lost.store(true, Ordering::SeqCst);
            let _ = err_events.try_send(DeviceEvent {
                action: DeviceAction::Removed,
                device_id: err_device.clone(),
            });
            err_ready.1.notify_all();
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = startup_tx.send(Err(PlatformError::StreamBuildError(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = startup_tx.send(Err(PlatformError::StreamPlayError(e.to_string())));
        return;
    }

    info!(device = %device_id, "capture stream playing");
    let _ = startup_tx.send(Ok(()));

    while !flags.stop.load(Ordering::SeqCst) && !flags.lost.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    data_ready.1.notify_all();
    if flags.lost.load(Ordering::SeqCst) {
        warn!(device = %device_id, "capture backend exiting after device loss");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.frame_samples, 480);
        assert!(config.device_name.is_none());
    }

    #[test]
    fn test_read_before_start_is_not_active() {
        let mut source = CpalLoopbackSource::new(CaptureConfig::default());
        assert!(!source.is_active());
        assert!(matches!(
            source.read_frame(Duration::from_millis(1)),
            Err(CaptureError::NotActive)
        ));
    }

    // Hardware-dependent test, kept for manual runs on machines with a
    // loopback device configured.
    #[test]
    #[ignore = "requires audio hardware and a loopback device"]
    fn test_capture_from_default_device() {
        let mut source = CpalLoopbackSource::new(CaptureConfig::default());
        if source.start().is_ok() {
            let result = source.read_frame(Duration::from_secs(1));
            source.stop();
            if let Ok(frame) = result {
                assert_eq!(frame.samples_per_channel(), 480);
            }
        }
    }
}
