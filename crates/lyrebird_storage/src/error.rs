//! Storage Error Types
//!
//! Disk-full and permission failures get their own kinds so callers can
//! pick distinct degraded paths; everything else stays an opaque I/O error
//! with the path preserved in the chain.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied: {path}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("disk full writing {path}")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write buffer full ({capacity} jobs pending)")]
    WriteBufferFull { capacity: usize },

    #[error("storage manager is closed")]
    Closed,

    #[error("backup {0} not found")]
    BackupNotFound(String),

    #[error("backup {id} failed verification: recorded crc {recorded:08x}, computed {computed:08x}")]
    BackupCorrupt { id: String, recorded: u32, computed: u32 },

    #[error("serialization failed")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// ENOSPC, for distinguishing disk-full from other I/O failures
#[cfg(unix)]
const ENOSPC: i32 = 28;

impl StorageError {
    /// Classify an `io::Error` for a given path into a storage error kind.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound { path, source },
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied { path, source },
            _ => {
                #[cfg(unix)]
                if source.raw_os_error() == Some(ENOSPC) {
                    return StorageError::DiskFull { path, source };
                }
                StorageError::Io { path, source }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = StorageError::from_io(
            Path::new("/missing"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(err.to_string().contains("/missing"));
    }

    #[test]
    fn test_permission_classification() {
        let err = StorageError::from_io(
            Path::new("/root/secret"),
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_full_classification() {
        let err = StorageError::from_io(Path::new("/data"), io::Error::from_raw_os_error(ENOSPC));
        assert!(matches!(err, StorageError::DiskFull { .. }));
    }

    #[test]
    fn test_source_chain_preserved() {
        use std::error::Error;
        let err = StorageError::from_io(
            Path::new("/x"),
            io::Error::new(io::ErrorKind::Other, "underlying"),
        );
        let source = err.source().expect("source must be preserved");
        assert!(source.to_string().contains("underlying"));
    }
}
