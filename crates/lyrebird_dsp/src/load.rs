//! Processing Load Gating
//!
//! Tracks an exponential moving average of per-frame processing cost
//! relative to the real-time budget. When the average load or the queue
//! depth exceeds its threshold the processor enters recovery mode and sheds
//! the sync and quality stages until load falls back under the threshold.

/// Real-time budget per frame, milliseconds (30 ms of audio at 16 kHz)
const TARGET_FRAME_MS: f64 = 30.0;

/// EMA weight given to the previous load value
const EMA_PREVIOUS: f64 = 0.8;

/// EMA weight given to the current frame
const EMA_CURRENT: f64 = 0.2;

/// Load above this enters recovery mode
pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.8;

/// Exponential-moving-average load tracker with a recovery latch
#[derive(Debug, Clone)]
pub struct LoadTracker {
    load: f64,
    threshold: f64,
    recovering: bool,
    recoveries: u64,
    dropped_frames: u64,
}

impl LoadTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            load: 0.0,
            threshold,
            recovering: false,
            recoveries: 0,
            dropped_frames: 0,
        }
    }

    /// Fold one frame's processing time into the moving average.
    pub fn record_frame(&mut self, frame_ms: f64) -> f64 {
        let instant_load = frame_ms / TARGET_FRAME_MS;
        self.load = EMA_PREVIOUS * self.load + EMA_CURRENT * instant_load;
        self.load
    }

    /// Decide whether the next frame should take the degraded path.
    ///
    /// Entering recovery is latched and counted once per episode; the latch
    /// clears as soon as neither condition holds.
    pub fn should_degrade(&mut self, queue_depth: usize, max_queue_depth: usize) -> bool {
        let overloaded = self.load > self.threshold || queue_depth > max_queue_depth;
        if overloaded {
            if !self.recovering {
                self.recovering = true;
                self.recoveries += 1;
            }
        } else {
            self.recovering = false;
        }
        overloaded
    }

    pub fn record_dropped_frame(&mut self) {
        self.dropped_frames += 1;
    }

    pub fn load(&self) -> f64 {
        self.load
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn recovery_count(&self) -> u64 {
        self.recoveries
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn reset(&mut self) {
        self.load = 0.0;
        self.recovering = false;
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_starts_idle() {
        let mut t = LoadTracker::default();
        assert_eq!(t.load(), 0.0);
        assert!(!t.should_degrade(0, 1024));
    }

    #[test]
    fn test_ema_convergence() {
        let mut t = LoadTracker::default();
        // Frames costing exactly the budget converge toward load 1.0
        for _ in 0..50 {
            t.record_frame(TARGET_FRAME_MS);
        }
        assert!(t.load() > 0.99);
    }

    #[test]
    fn test_enters_recovery_over_threshold() {
        let mut t = LoadTracker::default();
        for _ in 0..50 {
            t.record_frame(45.0); // 1.5x budget
        }
        assert!(t.should_degrade(0, 1024));
        assert!(t.is_recovering());
        assert_eq!(t.recovery_count(), 1);
    }

    #[test]
    fn test_recovery_counted_once_per_episode() {
        let mut t = LoadTracker::default();
        for _ in 0..50 {
            t.record_frame(60.0);
        }
        assert!(t.should_degrade(0, 1024));
        assert!(t.should_degrade(0, 1024));
        assert_eq!(t.recovery_count(), 1);

        // Cool down, then overload again
        for _ in 0..100 {
            t.record_frame(0.1);
        }
        assert!(!t.should_degrade(0, 1024));
        for _ in 0..50 {
            t.record_frame(60.0);
        }
        assert!(t.should_degrade(0, 1024));
        assert_eq!(t.recovery_count(), 2);
    }

    #[test]
    fn test_queue_depth_triggers_recovery() {
        let mut t = LoadTracker::default();
        assert!(t.should_degrade(2000, 1024));
        assert!(t.is_recovering());
    }

    #[test]
    fn test_exits_recovery_when_load_falls() {
        let mut t = LoadTracker::default();
        for _ in 0..50 {
            t.record_frame(60.0);
        }
        assert!(t.should_degrade(0, 1024));
        for _ in 0..100 {
            t.record_frame(0.1);
        }
        assert!(!t.should_degrade(0, 1024));
        assert!(!t.is_recovering());
    }
}
