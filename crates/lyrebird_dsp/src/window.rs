//! Adaptive Sync Window
//!
//! The cross-correlation window shrinks when per-frame processing time
//! climbs and grows back when the pipeline has headroom, trading alignment
//! accuracy for latency under load.

use crate::history::History;

/// Smallest permitted window, samples (15 ms at 16 kHz)
pub const MIN_WINDOW: usize = 240;

/// Largest permitted window, samples (60 ms at 16 kHz)
pub const MAX_WINDOW: usize = 960;

/// Default window, samples (30 ms at 16 kHz)
pub const DEFAULT_WINDOW: usize = 480;

/// Step applied on each adjustment, samples
const WINDOW_STEP: usize = 32;

/// Rolling mean above this shrinks the window, milliseconds
const SHRINK_ABOVE_MS: f64 = 5.0;

/// Rolling mean below this grows the window, milliseconds
const GROW_BELOW_MS: f64 = 2.0;

/// Tracks frame processing time and adapts the sync window size
#[derive(Debug, Clone)]
pub struct AdaptiveWindow {
    window: usize,
    processing_ms: History,
}

impl AdaptiveWindow {
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            processing_ms: History::default(),
        }
    }

    /// Current window size in samples
    pub fn window(&self) -> usize {
        self.window
    }

    /// Rolling mean of recorded frame times, milliseconds
    pub fn mean_processing_ms(&self) -> f64 {
        self.processing_ms.mean()
    }

    /// Record one frame's processing time and adjust the window.
    ///
    /// Returns the new window size.
    pub fn record(&mut self, frame_ms: f64) -> usize {
        self.processing_ms.push(frame_ms);
        let mean = self.processing_ms.mean();

        if mean > SHRINK_ABOVE_MS {
            self.window = self.window.saturating_sub(WINDOW_STEP).max(MIN_WINDOW);
        } else if mean < GROW_BELOW_MS {
            self.window = (self.window + WINDOW_STEP).min(MAX_WINDOW);
        }
        self.window
    }

    pub fn reset(&mut self) {
        self.window = DEFAULT_WINDOW;
        self.processing_ms.clear();
    }
}

impl Default for AdaptiveWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_default() {
        let w = AdaptiveWindow::new();
        assert_eq!(w.window(), DEFAULT_WINDOW);
    }

    #[test]
    fn test_shrinks_under_load() {
        let mut w = AdaptiveWindow::new();
        w.record(8.0);
        assert_eq!(w.window(), DEFAULT_WINDOW - 32);
        w.record(8.0);
        assert_eq!(w.window(), DEFAULT_WINDOW - 64);
    }

    #[test]
    fn test_shrink_stops_at_floor() {
        let mut w = AdaptiveWindow::new();
        for _ in 0..100 {
            w.record(20.0);
        }
        assert_eq!(w.window(), MIN_WINDOW);
    }

    #[test]
    fn test_grows_with_headroom() {
        let mut w = AdaptiveWindow::new();
        for _ in 0..100 {
            w.record(0.5);
        }
        assert_eq!(w.window(), MAX_WINDOW);
    }

    #[test]
    fn test_steady_zone_holds_window() {
        let mut w = AdaptiveWindow::new();
        for _ in 0..10 {
            w.record(3.0); // between the grow and shrink thresholds
        }
        assert_eq!(w.window(), DEFAULT_WINDOW);
    }

    #[test]
    fn test_reset() {
        let mut w = AdaptiveWindow::new();
        for _ in 0..20 {
            w.record(10.0);
        }
        w.reset();
        assert_eq!(w.window(), DEFAULT_WINDOW);
        assert_eq!(w.mean_processing_ms(), 0.0);
    }
}
