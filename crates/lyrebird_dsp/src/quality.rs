//! Audio Quality Scoring
//!
//! Derives a 0..1 quality metric per channel from peak, RMS, clipping and
//! zero-crossing statistics. The weighting targets speech-like material:
//! a crest factor (peak/RMS) near 4 scores highest, sustained tones and
//! near-silence score low.

/// Per-channel audio statistics produced by the processor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioStats {
    /// Normalized peak level, 0..1
    pub peak: f32,
    /// Normalized RMS level, 0..1
    pub rms: f32,
    /// Sample width in bytes (1, 2 or 4)
    pub sample_width: u8,
    /// Channel count the stats describe (1 after separation)
    pub channels: u8,
    /// Time spent computing the stats, milliseconds
    pub processing_duration_ms: f64,
    /// Composite quality score, 0..1
    pub quality: f32,
}

/// Individual score components, useful for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    pub peak: f32,
    pub rms: f32,
    pub crest_score: f32,
    pub level_score: f32,
    pub clip_score: f32,
    pub noise_score: f32,
    pub quality: f32,
}

/// RMS below this is treated as silence (quality 0)
const SILENCE_RMS: f32 = 1e-10;

/// Crest factors are capped here before scoring
const MAX_CREST_FACTOR: f32 = 20.0;

const FULL_SCALE: f32 = 32768.0;

/// Score a single channel of 16-bit samples.
pub fn score_samples(samples: &[i16]) -> QualityBreakdown {
    if samples.is_empty() {
        return QualityBreakdown {
            peak: 0.0,
            rms: 0.0,
            crest_score: 0.0,
            level_score: 0.0,
            clip_score: 1.0,
            noise_score: 1.0,
            quality: 0.0,
        };
    }

    let mut peak_abs = 0i32;
    let mut sum_sq = 0.0f64;
    let mut zero_crossings = 0usize;
    let mut prev = samples[0] as i32;

    for &s in samples {
        let v = s as i32;
        peak_abs = peak_abs.max(v.abs());
        sum_sq += (v as f64) * (v as f64);
        if (v as i64) * (prev as i64) < 0 {
            zero_crossings += 1;
        }
        prev = v;
    }

    let peak = peak_abs as f32 / FULL_SCALE;
    let rms = ((sum_sq / samples.len() as f64).sqrt() as f32) / FULL_SCALE;

    if rms < SILENCE_RMS {
        return QualityBreakdown {
            peak,
            rms,
            crest_score: 0.0,
            level_score: 0.0,
            clip_score: 1.0,
            noise_score: 1.0,
            quality: 0.0,
        };
    }

    let crest_factor = (peak / rms).min(MAX_CREST_FACTOR);
    let crest_score = (-0.5 * (crest_factor - 4.0).powi(2)).exp();

    let level_score = (2.0 * peak).min(1.0);

    let clip_score = if peak > 0.95 { 1.0 - peak / 0.99 } else { 1.0 };

    let noise_score = 1.0 - (zero_crossings as f32 / (0.5 * samples.len() as f32)).min(1.0);

    let quality = (0.3 * crest_score + 0.3 * level_score + 0.2 * clip_score + 0.2 * noise_score)
        .clamp(0.0, 1.0);

    QualityBreakdown {
        peak,
        rms,
        crest_score,
        level_score,
        clip_score,
        noise_score,
        quality,
    }
}

/// Score a channel and package the result as [`AudioStats`].
pub fn analyze(samples: &[i16], processing_duration_ms: f64) -> AudioStats {
    let breakdown = score_samples(samples);
    AudioStats {
        peak: breakdown.peak,
        rms: breakdown.rms,
        sample_width: 2,
        channels: 1,
        processing_duration_ms,
        quality: breakdown.quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, amplitude: f32, count: usize) -> Vec<i16> {
        (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate;
                (amplitude * FULL_SCALE * (2.0 * std::f32::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    /// Speech-like burst: mostly quiet with short loud transients,
    /// giving a crest factor near the scoring target of 4.
    fn bursty(count: usize) -> Vec<i16> {
        (0..count)
            .map(|i| {
                let base = 0.12 * (2.0 * std::f32::consts::PI * 180.0 * i as f32 / 16000.0).sin();
                let burst = if i % 160 < 10 {
                    0.48 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin()
                } else {
                    0.0
                };
                ((base + burst) * FULL_SCALE) as i16
            })
            .collect()
    }

    #[test]
    fn test_silence_scores_zero() {
        let samples = vec![0i16; 480];
        let b = score_samples(&samples);
        assert_eq!(b.quality, 0.0);
        assert_eq!(b.rms, 0.0);
    }

    #[test]
    fn test_empty_scores_zero() {
        let b = score_samples(&[]);
        assert_eq!(b.quality, 0.0);
    }

    #[test]
    fn test_sine_crest_factor() {
        // A pure sine has a crest factor of sqrt(2); the crest component of
        // the score is therefore tiny, but level/clip/noise keep a clean
        // mid-level tone well above noise floor material.
        let samples = sine(440.0, 16000.0, 0.5, 480);
        let b = score_samples(&samples);
        let crest = b.peak / b.rms;
        assert!((crest - std::f32::consts::SQRT_2).abs() < 0.1, "crest {crest}");
        assert!(b.quality >= 0.6, "quality {}", b.quality);
        assert!(b.quality < 0.8, "quality {}", b.quality);
    }

    #[test]
    fn test_bursty_signal_scores_high() {
        let samples = bursty(4800);
        let b = score_samples(&samples);
        let crest = b.peak / b.rms;
        assert!(crest > 2.5 && crest < 6.0, "crest {crest}");
        assert!(b.quality >= 0.8, "quality {}", b.quality);
    }

    #[test]
    fn test_clipping_penalized() {
        let clean = sine(440.0, 16000.0, 0.5, 480);
        let clipped = sine(440.0, 16000.0, 0.999, 480);
        let b_clean = score_samples(&clean);
        let b_clipped = score_samples(&clipped);
        assert!(b_clipped.clip_score < 0.1, "clip {}", b_clipped.clip_score);
        assert!(b_clipped.clip_score < b_clean.clip_score);
    }

    #[test]
    fn test_high_frequency_noise_penalized() {
        // Alternating full-swing samples cross zero every sample
        let noisy: Vec<i16> = (0..480)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        let b = score_samples(&noisy);
        assert!(b.noise_score < 0.1, "noise {}", b.noise_score);
    }

    #[test]
    fn test_quality_bounds() {
        for amp in [0.01, 0.1, 0.5, 0.9, 1.0] {
            let samples = sine(1000.0, 16000.0, amp, 480);
            let b = score_samples(&samples);
            assert!((0.0..=1.0).contains(&b.quality));
        }
    }

    #[test]
    fn test_analyze_packaging() {
        let samples = sine(440.0, 16000.0, 0.5, 480);
        let stats = analyze(&samples, 1.25);
        assert_eq!(stats.sample_width, 2);
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.processing_duration_ms, 1.25);
        assert!((stats.peak - 0.5).abs() < 0.02);
    }
}
