//! Transcript Persistence
//!
//! Each session's transcription results are kept as one JSON array with a
//! sibling `.crc` file holding the CRC32 of the JSON bytes. Appends are
//! buffered and flushed atomically (temp file + rename, then the sidecar),
//! so readers either see the previous consistent pair or the new one.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::layout::SessionLayout;

/// One transcribed segment as persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptRecord {
    pub timestamp: DateTime<Utc>,
    pub speaker_id: Option<String>,
    pub text: String,
    pub confidence: f32,
    /// "left" or "right"
    pub channel: String,
    pub duration_ms: f64,
    /// Estimated transcription cost for the segment
    pub cost: f64,
}

/// Buffered writer for one session's transcript file
pub struct TranscriptWriter {
    path: PathBuf,
    crc_path: PathBuf,
    records: Vec<TranscriptRecord>,
    unflushed: usize,
}

impl TranscriptWriter {
    pub fn new(layout: &SessionLayout, session_id: &str) -> Self {
        let path = layout.transcript_path(session_id);
        let crc_path = sidecar_path(&path);
        Self {
            path,
            crc_path,
            records: Vec::new(),
            unflushed: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one record. Call [`flush`](Self::flush) to persist.
    pub fn append(&mut self, record: TranscriptRecord) {
        self.records.push(record);
        self.unflushed += 1;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TranscriptRecord] {
        &self.records
    }

    /// Rewrite the JSON array and its CRC sidecar.
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.unflushed == 0 && self.path.exists() {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(&self.records)?;
        let crc = crc32fast::hash(&json);

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| StorageError::from_io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::from_io(&self.path, e))?;
        fs::write(&self.crc_path, format!("{crc:08x}"))
            .map_err(|e| StorageError::from_io(&self.crc_path, e))?;

        debug!(
            path = %self.path.display(),
            records = self.records.len(),
            "transcript flushed"
        );
        self.unflushed = 0;
        Ok(())
    }
}

/// Verify that a transcript file matches its CRC sidecar.
pub fn verify_transcript(path: &Path) -> StorageResult<bool> {
    let json = fs::read(path).map_err(|e| StorageError::from_io(path, e))?;
    let crc_path = sidecar_path(path);
    let recorded = fs::read_to_string(&crc_path).map_err(|e| StorageError::from_io(&crc_path, e))?;
    let computed = format!("{:08x}", crc32fast::hash(&json));
    Ok(recorded.trim() == computed)
}

/// Load the records of a persisted transcript.
pub fn load_transcript(path: &Path) -> StorageResult<Vec<TranscriptRecord>> {
    let json = fs::read(path).map_err(|e| StorageError::from_io(path, e))?;
    Ok(serde_json::from_slice(&json)?)
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".crc");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, channel: &str) -> TranscriptRecord {
        TranscriptRecord {
            timestamp: Utc::now(),
            speaker_id: Some(format!("speaker_{channel}")),
            text: text.to_string(),
            confidence: 0.92,
            channel: channel.to_string(),
            duration_ms: 1200.0,
            cost: 0.0004,
        }
    }

    #[test]
    fn test_append_flush_load() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut w = TranscriptWriter::new(&layout, "session1");
        w.append(record("hello", "left"));
        w.append(record("world", "right"));
        w.flush().unwrap();

        let loaded = load_transcript(w.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text, "hello");
        assert_eq!(loaded[1].channel, "right");
    }

    #[test]
    fn test_crc_sidecar_written() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut w = TranscriptWriter::new(&layout, "session1");
        w.append(record("x", "left"));
        w.flush().unwrap();

        assert!(verify_transcript(w.path()).unwrap());
    }

    #[test]
    fn test_crc_detects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut w = TranscriptWriter::new(&layout, "session1");
        w.append(record("x", "left"));
        w.flush().unwrap();

        fs::write(w.path(), b"[{\"evil\": true}]").unwrap();
        assert!(!verify_transcript(w.path()).unwrap());
    }

    #[test]
    fn test_flush_is_incremental_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut w = TranscriptWriter::new(&layout, "session1");
        w.append(record("one", "left"));
        w.flush().unwrap();
        w.append(record("two", "left"));
        w.flush().unwrap();

        let loaded = load_transcript(w.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(verify_transcript(w.path()).unwrap());
    }

    #[test]
    fn test_empty_flush_writes_empty_array() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut w = TranscriptWriter::new(&layout, "empty");
        w.flush().unwrap();
        let loaded = load_transcript(w.path()).unwrap();
        assert!(loaded.is_empty());
    }
}
