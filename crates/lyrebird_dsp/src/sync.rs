//! Channel Synchronization
//!
//! Detects and corrects small time offsets between the left and right
//! capture streams using FFT cross-correlation. A cheap short-window
//! Pearson check gates the expensive path: channels that are already
//! aligned, carry unrelated content, or differ wildly in energy are left
//! untouched.
//!
//! Offset convention: a positive offset means the right channel lags the
//! left by that many samples; alignment drops the lagging channel's leading
//! samples and trims the other channel's tail so lengths stay equal.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::window::MAX_WINDOW;

/// FFT size for cross-correlation.
///
/// Linear correlation of two windows of up to `MAX_WINDOW` samples needs at
/// least `2 * MAX_WINDOW` points; 2048 covers the largest adaptive window.
const FFT_SIZE: usize = 2048;

/// Sync tuning parameters
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Largest offset that will actually be applied, samples
    pub max_offset: usize,
    /// Minimum normalized peak correlation to trust an offset
    pub correlation_threshold: f32,
    /// Samples used by the cheap pre-check
    pub short_window: usize,
    /// Pearson correlation above this means already aligned
    pub aligned_threshold: f32,
    /// Pearson correlation below this means different content
    pub distinct_threshold: f32,
    /// Skip alignment when channel energies differ by more than this factor
    pub max_energy_ratio: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_offset: 160,
            correlation_threshold: 0.7,
            short_window: 240,
            aligned_threshold: 0.95,
            distinct_threshold: 0.2,
            max_energy_ratio: 2.0,
        }
    }
}

/// Result of a correlation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    /// Detected lag in samples; positive = right channel lags
    pub offset: isize,
    /// Normalized peak correlation, roughly 0..1
    pub correlation: f32,
}

/// Reusable cross-correlation engine
///
/// Holds the FFT plans and scratch buffers so per-frame work does not
/// allocate beyond the two spectra.
pub struct ChannelSync {
    config: SyncConfig,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    spectrum_left: Vec<Complex<f32>>,
    spectrum_right: Vec<Complex<f32>>,
}

impl ChannelSync {
    pub fn new(config: SyncConfig) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        Self {
            config,
            forward,
            inverse,
            spectrum_left: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            spectrum_right: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cheap gate deciding whether the correlation pass is worth running.
    pub fn needs_alignment(&self, left: &[i16], right: &[i16]) -> bool {
        let w = self.config.short_window.min(left.len()).min(right.len());
        if w < 2 {
            return false;
        }

        let lw = &left[..w];
        let rw = &right[..w];

        let r = pearson(lw, rw);
        if r > self.config.aligned_threshold || r < self.config.distinct_threshold {
            return false;
        }

        let el: f64 = lw.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let er: f64 = rw.iter().map(|&s| (s as f64) * (s as f64)).sum();
        if el == 0.0 || er == 0.0 {
            return false;
        }
        let ratio = el.max(er) / el.min(er);
        ratio <= self.config.max_energy_ratio as f64
    }

    /// Find the lag maximizing the cross-correlation of the two windows.
    ///
    /// Returns `None` when the windows are too short or the peak does not
    /// clear `correlation_threshold * sqrt(E_L * E_R)`.
    pub fn detect_offset(
        &mut self,
        left: &[i16],
        right: &[i16],
        window: usize,
    ) -> Option<SyncOutcome> {
        let w = window.min(left.len()).min(right.len()).min(MAX_WINDOW);
        if w < 16 {
            return None;
        }

        for slot in self.spectrum_left.iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }
        for slot in self.spectrum_right.iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }

        let mut energy_left = 0.0f64;
        let mut energy_right = 0.0f64;
        for i in 0..w {
            let l = left[i] as f32 / 32768.0;
            let r = right[i] as f32 / 32768.0;
            energy_left += (l as f64) * (l as f64);
            energy_right += (r as f64) * (r as f64);
            self.spectrum_left[i] = Complex::new(l, 0.0);
            self.spectrum_right[i] = Complex::new(r, 0.0);
        }
        if energy_left <= f64::EPSILON || energy_right <= f64::EPSILON {
            return None;
        }

        self.forward.process(&mut self.spectrum_left);
        self.forward.process(&mut self.spectrum_right);

        // corr[k] = IFFT(conj(L) * R)[k]: bin k holds the correlation at
        // lag +k, bin FFT_SIZE - k the correlation at lag -k.
        for i in 0..FFT_SIZE {
            self.spectrum_left[i] = self.spectrum_left[i].conj() * self.spectrum_right[i];
        }
        self.inverse.process(&mut self.spectrum_left);

        let scale = 1.0 / FFT_SIZE as f32;
        let max_lag = w - 1;
        let mut best_lag = 0isize;
        let mut best_value = f32::NEG_INFINITY;
        for lag in 0..=max_lag {
            let v = self.spectrum_left[lag].re * scale;
            if v > best_value {
                best_value = v;
                best_lag = lag as isize;
            }
        }
        for lag in 1..=max_lag {
            let v = self.spectrum_left[FFT_SIZE - lag].re * scale;
            if v > best_value {
                best_value = v;
                best_lag = -(lag as isize);
            }
        }

        let norm = (energy_left * energy_right).sqrt() as f32;
        let correlation = best_value / norm;
        if correlation < self.config.correlation_threshold {
            return None;
        }

        Some(SyncOutcome {
            offset: best_lag,
            correlation,
        })
    }

    /// Detect and, when within bounds, apply the channel offset.
    ///
    /// Returns the applied outcome, or `None` when the gate skipped the
    /// pass, the channels looked uncorrelated, or the detected offset
    /// exceeded `max_offset` (which is left unapplied by design of the
    /// bounded-shift contract).
    pub fn align(
        &mut self,
        left: &mut Vec<i16>,
        right: &mut Vec<i16>,
        window: usize,
    ) -> Option<SyncOutcome> {
        if !self.needs_alignment(left, right) {
            return None;
        }

        let outcome = self.detect_offset(left, right, window)?;
        let magnitude = outcome.offset.unsigned_abs();
        if magnitude > self.config.max_offset {
            return None;
        }

        if outcome.offset > 0 {
            // Right lags: drop its leading samples, trim left's tail
            right.drain(..magnitude);
            let keep = left.len().saturating_sub(magnitude);
            left.truncate(keep);
        } else if outcome.offset < 0 {
            left.drain(..magnitude);
            let keep = right.len().saturating_sub(magnitude);
            right.truncate(keep);
        }

        Some(outcome)
    }
}

/// Pearson correlation coefficient of two equal-length sample windows
fn pearson(a: &[i16], b: &[i16]) -> f32 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a: f64 = a[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mean_b: f64 = b[..n].iter().map(|&v| v as f64).sum::<f64>() / n as f64;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for i in 0..n {
        let da = a[i] as f64 - mean_a;
        let db = b[i] as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (cov / denom) as f32
    }
}
