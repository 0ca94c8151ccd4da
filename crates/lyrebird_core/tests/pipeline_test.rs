//! End-to-end pipeline tests against the simulated capture source.
//!
//! These run the real engine - workers, queues, pool, storage, cleanup -
//! with deterministic input and a fixed transcription client, then verify
//! the on-disk session and the resource accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lyrebird_core::{
    CleanupPhase, ComponentState, EngineConfig, PipelineEvent, PoolLimits, TranscriberEngine,
};
use lyrebird_platform::{FixedTranscriptionClient, SimConfig, SimulatedSource};
use lyrebird_storage::{load_transcript, verify_transcript};

fn engine_with_frames(
    base: &std::path::Path,
    frames: u64,
    right_delay: usize,
) -> TranscriberEngine {
    let mut config = EngineConfig::new(base);
    config.session_id = "test_session".into();
    config.min_segment_ms = 300.0;
    // The simulated source produces frames as fast as they are read;
    // plenty of small buffers keeps transient backlogs off the error path
    config.pool = PoolLimits {
        small: 256,
        ..PoolLimits::default()
    };

    let source = SimulatedSource::new(SimConfig {
        frame_budget: Some(frames),
        right_delay_samples: right_delay,
        ..Default::default()
    });
    let client = Arc::new(FixedTranscriptionClient::new("hello from the wire", 0.9));

    TranscriberEngine::new(config, Box::new(source), client).expect("engine construction")
}

/// Poll until the pipeline queues and the write buffer are empty.
fn wait_for_drain(engine: &TranscriberEngine, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let status = engine.status().unwrap();
        let queued: usize = status.queues.iter().map(|q| q.depth).sum();
        if queued == 0 && status.storage.pending == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_full_session_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 40, 0);

    engine.start().unwrap();

    // All components reach RUNNING once startup completes
    let status = engine.status().unwrap();
    for (id, state) in &status.components {
        assert_eq!(*state, ComponentState::Running, "component {id}");
    }

    assert!(
        engine.wait_for_capture_end(Duration::from_secs(10)),
        "capture should end on the simulated EOS"
    );
    assert!(
        wait_for_drain(&engine, Duration::from_secs(10)),
        "pipeline should drain after capture ends"
    );
    // Let the transcription worker finish any in-flight segments
    std::thread::sleep(Duration::from_millis(300));

    engine.shutdown().unwrap();

    // Cleanup ran to completion
    let status = engine.status().unwrap();
    assert_eq!(status.cleanup.phase, CleanupPhase::Completed);

    // Every pool buffer made it home
    assert_eq!(status.pool.total_in_use(), 0, "pool buffers leaked");

    // Channel-separated PCM landed on disk
    let left_files: Vec<_> = std::fs::read_dir(tmp.path().join("recordings/left"))
        .unwrap()
        .collect();
    let right_files: Vec<_> = std::fs::read_dir(tmp.path().join("recordings/right"))
        .unwrap()
        .collect();
    assert!(!left_files.is_empty(), "no left-channel recordings");
    assert!(!right_files.is_empty(), "no right-channel recordings");

    // 40 frames of 480 samples, 16-bit: raw chunks are sample-aligned
    for entry in left_files {
        let len = entry.unwrap().metadata().unwrap().len();
        assert_eq!(len % 2, 0, "recordings must be whole 16-bit samples");
        assert!(len > 0);
    }
}

#[test]
fn test_transcripts_written_with_crc() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 40, 0);

    engine.start().unwrap();
    engine.wait_for_capture_end(Duration::from_secs(10));
    wait_for_drain(&engine, Duration::from_secs(10));
    std::thread::sleep(Duration::from_millis(500));
    engine.shutdown().unwrap();

    let transcript_path = tmp.path().join("transcriptions/test_session.json");
    assert!(transcript_path.is_file(), "transcript file missing");
    assert!(
        verify_transcript(&transcript_path).unwrap(),
        "transcript CRC sidecar mismatch"
    );

    let records = load_transcript(&transcript_path).unwrap();
    assert!(!records.is_empty(), "no transcription records");
    for record in &records {
        assert_eq!(record.text, "hello from the wire");
        assert!((record.confidence - 0.9).abs() < 1e-6);
        assert!(record.duration_ms >= 300.0, "below minimum segment span");
        assert!(record.channel == "left" || record.channel == "right");
    }
}

#[test]
fn test_started_event_emitted() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 5, 0);

    engine.start().unwrap();
    let mut saw_started = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(PipelineEvent::Started) = engine.poll_event() {
            saw_started = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saw_started);

    engine.wait_for_capture_end(Duration::from_secs(5));
    engine.shutdown().unwrap();
}

#[test]
fn test_shutdown_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 3, 0);

    engine.start().unwrap();
    engine.wait_for_capture_end(Duration::from_secs(5));
    engine.shutdown().unwrap();
    // Second shutdown is a no-op on a completed cleanup
    engine.shutdown().unwrap();
    assert_eq!(
        engine.status().unwrap().cleanup.phase,
        CleanupPhase::Completed
    );
}

#[test]
fn test_empty_session_shuts_down_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 0, 0);

    engine.start().unwrap();
    engine.wait_for_capture_end(Duration::from_secs(5));
    engine.shutdown().unwrap();

    let status = engine.status().unwrap();
    assert_eq!(status.cleanup.phase, CleanupPhase::Completed);
    assert_eq!(status.pool.total_in_use(), 0);
}

#[test]
fn test_session_backup_and_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_frames(tmp.path(), 20, 0);

    engine.start().unwrap();
    engine.wait_for_capture_end(Duration::from_secs(10));
    wait_for_drain(&engine, Duration::from_secs(10));

    let backup_id = engine.create_backup(false).unwrap();
    engine.verify_backup(&backup_id).unwrap();

    let archive = engine.archive_session().unwrap();
    assert!(archive.is_file());
    assert!(archive.ends_with("archives/session_test_session.tar.gz"));

    engine.shutdown().unwrap();
}
