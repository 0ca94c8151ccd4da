//! Performance Snapshot Log
//!
//! Appends one JSON object per line to `logs/performance_YYYYMMDD.jsonl`,
//! rolling to a new file when the local date changes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::layout::SessionLayout;

/// Line-delimited JSON appender for monitoring snapshots
pub struct PerformanceLog {
    layout: SessionLayout,
    current: Option<(String, File)>,
    lines_written: u64,
}

impl PerformanceLog {
    pub fn new(layout: SessionLayout) -> Self {
        Self {
            layout,
            current: None,
            lines_written: 0,
        }
    }

    /// Append one snapshot as a JSON line.
    pub fn append<S: Serialize>(&mut self, snapshot: &S) -> StorageResult<()> {
        let now = Local::now();
        let day = now.format("%Y%m%d").to_string();

        let needs_open = match &self.current {
            Some((open_day, _)) => *open_day != day,
            None => true,
        };
        if needs_open {
            let path: PathBuf = self.layout.perf_log_path(now);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::from_io(&path, e))?;
            debug!(path = %path.display(), "performance log opened");
            self.current = Some((day, file));
        }

        let (_, file) = self.current.as_mut().expect("log file just opened");
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');
        file.write_all(&line)
            .map_err(|e| StorageError::from_io(&self.layout.logs_dir(), e))?;
        self.lines_written += 1;
        Ok(())
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Snapshot {
        cpu_usage_pct: f32,
        error_count: u64,
    }

    #[test]
    fn test_append_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        let mut log = PerformanceLog::new(layout.clone());
        log.append(&Snapshot {
            cpu_usage_pct: 12.5,
            error_count: 0,
        })
        .unwrap();
        log.append(&Snapshot {
            cpu_usage_pct: 50.0,
            error_count: 2,
        })
        .unwrap();
        assert_eq!(log.lines_written(), 2);

        let path = layout.perf_log_path(Local::now());
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Snapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.cpu_usage_pct, 12.5);
        let second: Snapshot = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.error_count, 2);
    }

    #[test]
    fn test_appends_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();

        {
            let mut log = PerformanceLog::new(layout.clone());
            log.append(&Snapshot {
                cpu_usage_pct: 1.0,
                error_count: 0,
            })
            .unwrap();
        }
        {
            let mut log = PerformanceLog::new(layout.clone());
            log.append(&Snapshot {
                cpu_usage_pct: 2.0,
                error_count: 0,
            })
            .unwrap();
        }

        let content =
            std::fs::read_to_string(layout.perf_log_path(Local::now())).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
