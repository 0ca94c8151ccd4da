//! Engine Configuration

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;

use lyrebird_dsp::ProcessorConfig;
use lyrebird_platform::RetryPolicy;
use lyrebird_storage::{BackupRotation, StorageConfig};

use crate::monitoring::MonitoringConfig;
use crate::pool::PoolLimits;
use crate::queues::OptimizerConfig;

/// Everything the pipeline engine needs to run one session
#[derive(Clone)]
pub struct EngineConfig {
    /// Base directory for the session layout
    pub base_dir: PathBuf,
    /// Session identifier; used for transcript and archive names
    pub session_id: String,
    /// Capture sample rate, Hz
    pub sample_rate: u32,
    /// Samples per channel per captured frame
    pub frame_samples: usize,
    /// Initial capacity of each pipeline queue
    pub queue_capacity: usize,
    /// Shortest audio span submitted for transcription, milliseconds
    pub min_segment_ms: f64,
    /// Transcription submissions allowed per minute
    pub transcriptions_per_minute: u32,
    /// How long workers block on queue and frame reads
    pub read_timeout: Duration,

    pub pool: PoolLimits,
    pub monitoring: MonitoringConfig,
    pub processor: ProcessorConfig,
    pub storage: StorageConfig,
    pub optimizer: OptimizerConfig,
    pub rotation: BackupRotation,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            session_id: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            sample_rate: 16_000,
            frame_samples: 480,
            queue_capacity: 32,
            min_segment_ms: 400.0,
            transcriptions_per_minute: 10,
            read_timeout: Duration::from_millis(100),
            pool: PoolLimits::default(),
            monitoring: MonitoringConfig::default(),
            processor: ProcessorConfig::default(),
            storage: StorageConfig::default(),
            optimizer: OptimizerConfig::default(),
            rotation: BackupRotation::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Validate the cross-cutting constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate < 8_000 || self.sample_rate > 192_000 {
            return Err(format!("invalid sample rate: {}", self.sample_rate));
        }
        if self.frame_samples == 0 || self.frame_samples > 1 << 16 {
            return Err(format!("invalid frame size: {}", self.frame_samples));
        }
        // One frame (both channels, 16-bit) must fit the largest tier
        let frame_bytes = self.frame_samples * 4;
        if frame_bytes > crate::pool::BufferTier::Large.size() {
            return Err(format!("frame of {frame_bytes} bytes exceeds the largest buffer tier"));
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be at least 1".into());
        }
        if self.min_segment_ms <= 0.0 {
            return Err("minimum segment duration must be positive".into());
        }
        if self.session_id.is_empty() {
            return Err("session id must not be empty".into());
        }
        Ok(())
    }

    /// Frame duration implied by `frame_samples` and `sample_rate`, ms
    pub fn frame_ms(&self) -> f64 {
        self.frame_samples as f64 / self.sample_rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EngineConfig::new("/tmp/lyrebird-test");
        config.validate().unwrap();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.frame_samples, 480);
        assert!((config.frame_ms() - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::new("/tmp/x");
        config.sample_rate = 100;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new("/tmp/x");
        config.frame_samples = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new("/tmp/x");
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new("/tmp/x");
        config.session_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_ids_are_timestamped() {
        let config = EngineConfig::new("/tmp/x");
        assert_eq!(config.session_id.len(), "20260801_120000".len());
    }
}
