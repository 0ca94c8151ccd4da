//! Session Archiving
//!
//! On explicit rollover a session's recordings, transcriptions and logs are
//! packed into `archives/session_<id>.tar.gz`. Archiving copies; it does
//! not delete the source directories.

use std::fs::File;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::layout::SessionLayout;

/// Packs finished sessions into compressed archives
pub struct SessionArchiver {
    layout: SessionLayout,
}

impl SessionArchiver {
    pub fn new(layout: SessionLayout) -> Self {
        Self { layout }
    }

    /// Create `archives/session_<id>.tar.gz` from the current session tree.
    pub fn archive_session(&self, session_id: &str) -> StorageResult<PathBuf> {
        let archive_path = self.layout.archive_path(session_id);
        let file =
            File::create(&archive_path).map_err(|e| StorageError::from_io(&archive_path, e))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (name, dir) in [
            ("recordings", self.layout.recordings_dir()),
            ("transcriptions", self.layout.transcriptions_dir()),
            ("logs", self.layout.logs_dir()),
        ] {
            if dir.is_dir() {
                builder
                    .append_dir_all(name, &dir)
                    .map_err(|e| StorageError::from_io(&dir, e))?;
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| StorageError::from_io(&archive_path, e))?;
        encoder
            .finish()
            .map_err(|e| StorageError::from_io(&archive_path, e))?;

        info!(
            session_id,
            path = %archive_path.display(),
            "session archived"
        );
        Ok(archive_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn test_archive_contains_session_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();
        std::fs::write(layout.left_recordings().join("c.raw"), b"pcm").unwrap();
        std::fs::write(layout.transcript_path("s"), b"[]").unwrap();

        let archiver = SessionArchiver::new(layout.clone());
        let path = archiver.archive_session("s").unwrap();
        assert!(path.is_file());
        assert!(path.ends_with("archives/session_s.tar.gz"));

        // Walk the archive and confirm the entries made it in
        let file = File::open(&path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(
            names.iter().any(|n| n == "recordings/left/c.raw"),
            "names: {names:?}"
        );
        assert!(names.iter().any(|n| n == "transcriptions/s.json"));
    }

    #[test]
    fn test_source_files_survive_archiving() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();
        let source = layout.left_recordings().join("keep.raw");
        std::fs::write(&source, b"data").unwrap();

        SessionArchiver::new(layout).archive_session("s").unwrap();
        assert!(source.is_file());
    }
}
