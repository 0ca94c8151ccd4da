//! Session Directory Layout
//!
//! All persisted artifacts live under one configurable base directory:
//!
//! ```text
//! <base>/
//!   recordings/{left,right}/*.raw      16-bit LE PCM, channel-separated
//!   logs/transcriber_YYYYMMDD_HHMMSS.log
//!   logs/performance_YYYYMMDD.jsonl
//!   backup/<id>/                       rotated backups + meta.json each
//!   emergency_backup/emergency_<ts>_<n>.tmp
//!   transcriptions/<session>.json (+ .crc sidecar)
//!   archives/session_<id>.tar.gz
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use crate::error::{StorageError, StorageResult};

/// Resolves and creates the on-disk layout for one session
#[derive(Debug, Clone)]
pub struct SessionLayout {
    base: PathBuf,
}

impl SessionLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create every directory in the layout.
    pub fn ensure(&self) -> StorageResult<()> {
        for dir in [
            self.left_recordings(),
            self.right_recordings(),
            self.logs_dir(),
            self.backup_dir(),
            self.emergency_dir(),
            self.transcriptions_dir(),
            self.archives_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| StorageError::from_io(&dir, e))?;
        }
        info!(base = %self.base.display(), "session layout ready");
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.base.join("recordings")
    }

    pub fn left_recordings(&self) -> PathBuf {
        self.recordings_dir().join("left")
    }

    pub fn right_recordings(&self) -> PathBuf {
        self.recordings_dir().join("right")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base.join("backup")
    }

    pub fn emergency_dir(&self) -> PathBuf {
        self.base.join("emergency_backup")
    }

    pub fn transcriptions_dir(&self) -> PathBuf {
        self.base.join("transcriptions")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.base.join("archives")
    }

    /// Raw PCM chunk path for one channel, e.g. `recordings/left/chunk_00042_1712.raw`
    pub fn recording_path(&self, channel: &str, sequence: u64, unix_ts: u64) -> PathBuf {
        self.recordings_dir()
            .join(channel)
            .join(format!("chunk_{sequence:05}_{unix_ts}.raw"))
    }

    /// Session log file name, e.g. `transcriber_20260801_133000.log`
    pub fn log_file_name(now: DateTime<Local>) -> String {
        format!("transcriber_{}.log", now.format("%Y%m%d_%H%M%S"))
    }

    /// Performance JSONL path for a given day
    pub fn perf_log_path(&self, now: DateTime<Local>) -> PathBuf {
        self.logs_dir()
            .join(format!("performance_{}.jsonl", now.format("%Y%m%d")))
    }

    /// Transcript file path for a session id
    pub fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.transcriptions_dir().join(format!("{session_id}.json"))
    }

    /// Archive path for a session id
    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.archives_dir()
            .join(format!("session_{session_id}.tar.gz"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        assert!(layout.left_recordings().is_dir());
        assert!(layout.right_recordings().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.backup_dir().is_dir());
        assert!(layout.emergency_dir().is_dir());
        assert!(layout.transcriptions_dir().is_dir());
        assert!(layout.archives_dir().is_dir());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();
        layout.ensure().unwrap();
    }

    #[test]
    fn test_file_names() {
        let now = Local.with_ymd_and_hms(2026, 8, 1, 13, 30, 0).unwrap();
        assert_eq!(
            SessionLayout::log_file_name(now),
            "transcriber_20260801_133000.log"
        );

        let layout = SessionLayout::new("/tmp/lyrebird");
        assert!(layout
            .perf_log_path(now)
            .ends_with("logs/performance_20260801.jsonl"));
        assert!(layout
            .recording_path("left", 42, 1712)
            .ends_with("recordings/left/chunk_00042_1712.raw"));
        assert!(layout
            .archive_path("abc")
            .ends_with("archives/session_abc.tar.gz"));
        assert!(layout
            .transcript_path("abc")
            .ends_with("transcriptions/abc.json"));
    }
}
