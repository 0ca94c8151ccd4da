//! Channel sync and quality scoring benchmarks
//!
//! Run with: cargo bench -p lyrebird_dsp

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lyrebird_dsp::{score_samples, ChannelSync, SyncConfig};

fn test_signal(len: usize, delay: usize) -> (Vec<i16>, Vec<i16>) {
    let sig: Vec<i16> = (0..len + delay)
        .map(|i| {
            let t = i as f32 / 16000.0;
            let v = 0.4 * (2.0 * std::f32::consts::PI * 30.0 * t).sin()
                + 0.3 * (2.0 * std::f32::consts::PI * 320.0 * t).sin();
            (v * 20000.0) as i16
        })
        .collect();
    (sig[delay..delay + len].to_vec(), sig[..len].to_vec())
}

fn bench_detect_offset(c: &mut Criterion) {
    let mut sync = ChannelSync::new(SyncConfig::default());
    let (left, right) = test_signal(960, 100);

    c.bench_function("detect_offset_480", |b| {
        b.iter(|| sync.detect_offset(black_box(&left), black_box(&right), 480))
    });

    c.bench_function("detect_offset_960", |b| {
        b.iter(|| sync.detect_offset(black_box(&left), black_box(&right), 960))
    });
}

fn bench_quality(c: &mut Criterion) {
    let (samples, _) = test_signal(480, 0);

    c.bench_function("score_samples_480", |b| {
        b.iter(|| score_samples(black_box(&samples)))
    });
}

criterion_group!(benches, bench_detect_offset, bench_quality);
criterion_main!(benches);
