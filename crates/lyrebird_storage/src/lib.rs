//! Lyrebird Storage - Persistence Layer
//!
//! Everything the pipeline puts on disk goes through this crate:
//! - Bounded-latency asynchronous writes of channel-separated PCM
//! - Emergency flush of the write buffer during shutdown
//! - Backup creation, verification and rotation with CRC32 metadata
//! - Transcript files with CRC sidecars
//! - Line-delimited performance snapshots
//! - Session archives on explicit rollover
//!
//! Buffer-pool ownership stays outside: jobs that carry a pool buffer id
//! hand the backing bytes back through the [`BufferReleaser`] trait once
//! the write settles.

mod archive;
mod backup;
mod error;
mod layout;
mod perf_log;
mod transcripts;
mod writer;

pub use archive::SessionArchiver;
pub use backup::{BackupManager, BackupMetadata, BackupRotation};
pub use error::{StorageError, StorageResult};
pub use layout::SessionLayout;
pub use perf_log::PerformanceLog;
pub use transcripts::{load_transcript, verify_transcript, TranscriptRecord, TranscriptWriter};
pub use writer::{
    BufferReleaser, FlushReport, StorageConfig, StorageManager, WriteJob, WriteMetrics,
};
