//! Backup Creation, Verification and Rotation
//!
//! Each backup is a directory under `backup/<id>/` holding copies of the
//! session's recordings and transcriptions plus a `meta.json` describing
//! it. The metadata file is written via temp-file + rename and a backup is
//! only visible to `list_backups` (and therefore to rotation) once its
//! metadata is durable, so an in-progress backup can never be rotated away.
//!
//! Incremental backups copy only files modified since the previous backup
//! of any kind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::layout::SessionLayout;

const META_FILE: &str = "meta.json";

/// Rotation policy for the backup directory
#[derive(Debug, Clone, Copy)]
pub struct BackupRotation {
    /// Keep at most this many backups
    pub max_backups: usize,
    /// Remove backups older than this
    pub max_age: Duration,
    /// When known free space falls below this, drop oldest backups first
    pub min_free_space: u64,
}

impl Default for BackupRotation {
    fn default() -> Self {
        Self {
            max_backups: 5,
            max_age: Duration::from_secs(7 * 24 * 3600),
            min_free_space: 100 * 1024 * 1024,
        }
    }
}

/// Durable description of one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Total payload bytes copied
    pub size: u64,
    pub incremental: bool,
    /// CRC32 over all copied file contents, in sorted relative-path order
    pub crc32: u32,
}

/// Creates, verifies and rotates backups under the session layout
pub struct BackupManager {
    layout: SessionLayout,
    rotation: BackupRotation,
    last_backup: Option<SystemTime>,
    sequence: u64,
}

impl BackupManager {
    pub fn new(layout: SessionLayout, rotation: BackupRotation) -> Self {
        Self {
            layout,
            rotation,
            last_backup: None,
            sequence: 0,
        }
    }

    pub fn rotation(&self) -> BackupRotation {
        self.rotation
    }

    pub fn configure_rotation(&mut self, rotation: BackupRotation) {
        self.rotation = rotation;
    }

    /// Snapshot the session's recordings and transcriptions.
    ///
    /// Returns the new backup id. The backup becomes visible only after its
    /// metadata lands, so a crash mid-copy leaves an orphan directory that
    /// `list_backups` ignores and `prune_orphans` can sweep.
    pub fn create_backup(&mut self, incremental: bool) -> StorageResult<String> {
        let now = Utc::now();
        self.sequence += 1;
        let id = format!("backup_{}_{:03}", now.format("%Y%m%d_%H%M%S"), self.sequence);
        let dest = self.layout.backup_dir().join(&id);
        fs::create_dir_all(&dest).map_err(|e| StorageError::from_io(&dest, e))?;

        let since = if incremental { self.last_backup } else { None };
        let sources = [
            ("recordings", self.layout.recordings_dir()),
            ("transcriptions", self.layout.transcriptions_dir()),
        ];

        let mut copied: Vec<(String, PathBuf)> = Vec::new();
        for (prefix, source) in &sources {
            collect_files(source, since, &mut |rel, abs| {
                copied.push((format!("{prefix}/{rel}"), abs.to_path_buf()));
            })?;
        }
        copied.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = crc32fast::Hasher::new();
        let mut total_size = 0u64;
        for (rel, abs) in &copied {
            let bytes = fs::read(abs).map_err(|e| StorageError::from_io(abs, e))?;
            hasher.update(&bytes);
            total_size += bytes.len() as u64;

            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| StorageError::from_io(parent, e))?;
            }
            fs::write(&target, &bytes).map_err(|e| StorageError::from_io(&target, e))?;
        }

        let metadata = BackupMetadata {
            id: id.clone(),
            timestamp: now,
            size: total_size,
            incremental,
            crc32: hasher.finalize(),
        };

        // Atomic publish: the backup exists once meta.json is in place
        let meta_tmp = dest.join("meta.json.tmp");
        let meta_path = dest.join(META_FILE);
        let json = serde_json::to_vec_pretty(&metadata)?;
        fs::write(&meta_tmp, &json).map_err(|e| StorageError::from_io(&meta_tmp, e))?;
        fs::rename(&meta_tmp, &meta_path).map_err(|e| StorageError::from_io(&meta_path, e))?;

        self.last_backup = Some(SystemTime::now());
        info!(
            id,
            incremental,
            files = copied.len(),
            bytes = total_size,
            "backup created"
        );
        Ok(id)
    }

    /// Recompute the content checksum of a backup and compare it with the
    /// recorded one.
    pub fn verify_backup(&self, id: &str) -> StorageResult<()> {
        let dir = self.layout.backup_dir().join(id);
        let meta_path = dir.join(META_FILE);
        if !meta_path.is_file() {
            return Err(StorageError::BackupNotFound(id.to_string()));
        }
        let meta: BackupMetadata = serde_json::from_slice(
            &fs::read(&meta_path).map_err(|e| StorageError::from_io(&meta_path, e))?,
        )?;

        let mut files: Vec<(String, PathBuf)> = Vec::new();
        collect_files(&dir, None, &mut |rel, abs| {
            if rel != META_FILE {
                files.push((rel.to_string(), abs.to_path_buf()));
            }
        })?;
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = crc32fast::Hasher::new();
        for (_, abs) in &files {
            let bytes = fs::read(abs).map_err(|e| StorageError::from_io(abs, e))?;
            hasher.update(&bytes);
        }
        let computed = hasher.finalize();
        if computed != meta.crc32 {
            return Err(StorageError::BackupCorrupt {
                id: id.to_string(),
                recorded: meta.crc32,
                computed,
            });
        }
        debug!(id, "backup verified");
        Ok(())
    }

    /// Published backups, oldest first.
    pub fn list_backups(&self) -> StorageResult<Vec<BackupMetadata>> {
        let dir = self.layout.backup_dir();
        let mut out = Vec::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::from_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::from_io(&dir, e))?;
            let meta_path = entry.path().join(META_FILE);
            if !meta_path.is_file() {
                continue; // unpublished or foreign directory
            }
            match fs::read(&meta_path) {
                Ok(bytes) => match serde_json::from_slice::<BackupMetadata>(&bytes) {
                    Ok(meta) => out.push(meta),
                    Err(e) => warn!(path = %meta_path.display(), error = %e, "bad backup metadata"),
                },
                Err(e) => warn!(path = %meta_path.display(), error = %e, "unreadable backup metadata"),
            }
        }
        out.sort_by_key(|m| m.timestamp);
        Ok(out)
    }

    /// Apply the rotation policy.
    ///
    /// `free_space` is the caller-supplied free-space reading for the
    /// backup volume, when available. Returns the removed backup ids.
    pub fn rotate(&self, free_space: Option<u64>) -> StorageResult<Vec<String>> {
        let backups = self.list_backups()?;
        let mut removed = Vec::new();
        let now = Utc::now();

        let mut survivors: Vec<&BackupMetadata> = backups.iter().collect();

        // Age limit
        let max_age = chrono::Duration::from_std(self.rotation.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        survivors.retain(|meta| {
            if now.signed_duration_since(meta.timestamp) > max_age {
                removed.push(meta.id.clone());
                false
            } else {
                true
            }
        });

        // Count limit, oldest first
        while survivors.len() > self.rotation.max_backups {
            removed.push(survivors.remove(0).id.clone());
        }

        // Free-space pressure: shed oldest until the budget clears
        if let Some(mut free) = free_space {
            while free < self.rotation.min_free_space && !survivors.is_empty() {
                let victim = survivors.remove(0);
                free = free.saturating_add(victim.size);
                removed.push(victim.id.clone());
            }
        }

        for id in &removed {
            let dir = self.layout.backup_dir().join(id);
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(id, error = %e, "failed to remove rotated backup");
            } else {
                debug!(id, "backup rotated out");
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "backup rotation removed backups");
        }
        Ok(removed)
    }

    /// Remove directories that never published metadata (crashed backups).
    pub fn prune_orphans(&self) -> StorageResult<usize> {
        let dir = self.layout.backup_dir();
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut pruned = 0;
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::from_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::from_io(&dir, e))?;
            let path = entry.path();
            if path.is_dir() && !path.join(META_FILE).is_file() {
                if fs::remove_dir_all(&path).is_ok() {
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Whether the backup set currently satisfies the rotation policy.
    pub fn within_limits(&self) -> bool {
        match self.list_backups() {
            Ok(backups) => backups.len() <= self.rotation.max_backups,
            Err(_) => false,
        }
    }
}

/// Walk `root` recursively, invoking `visit(relative_path, absolute_path)`
/// for each file, optionally filtered by modification time.
fn collect_files(
    root: &Path,
    modified_since: Option<SystemTime>,
    visit: &mut dyn FnMut(&str, &Path),
) -> StorageResult<()> {
    fn walk(
        root: &Path,
        dir: &Path,
        modified_since: Option<SystemTime>,
        visit: &mut dyn FnMut(&str, &Path),
    ) -> StorageResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let entries = fs::read_dir(dir).map_err(|e| StorageError::from_io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::from_io(dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, modified_since, visit)?;
            } else if path.is_file() {
                if let Some(since) = modified_since {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    if modified < since {
                        continue;
                    }
                }
                if let Ok(rel) = path.strip_prefix(root) {
                    visit(&rel.to_string_lossy(), &path);
                }
            }
        }
        Ok(())
    }
    walk(root, root, modified_since, visit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupManager) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        layout.ensure().unwrap();
        fs::write(layout.left_recordings().join("a.raw"), b"left data").unwrap();
        fs::write(layout.right_recordings().join("b.raw"), b"right data").unwrap();
        fs::write(layout.transcript_path("s1"), b"[]").unwrap();
        let manager = BackupManager::new(layout, BackupRotation::default());
        (tmp, manager)
    }

    #[test]
    fn test_create_and_list() {
        let (_tmp, mut m) = setup();
        let id = m.create_backup(false).unwrap();

        let backups = m.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, id);
        assert!(!backups[0].incremental);
        assert_eq!(
            backups[0].size,
            ("left data".len() + "right data".len() + 2) as u64
        );
    }

    #[test]
    fn test_verify_roundtrip() {
        let (_tmp, mut m) = setup();
        let id = m.create_backup(false).unwrap();
        m.verify_backup(&id).unwrap();
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (tmp, mut m) = setup();
        let id = m.create_backup(false).unwrap();

        let victim = tmp
            .path()
            .join("backup")
            .join(&id)
            .join("recordings/left/a.raw");
        fs::write(&victim, b"tampered").unwrap();

        let err = m.verify_backup(&id).unwrap_err();
        assert!(matches!(err, StorageError::BackupCorrupt { .. }));
    }

    #[test]
    fn test_verify_missing_backup() {
        let (_tmp, m) = setup();
        assert!(matches!(
            m.verify_backup("nope"),
            Err(StorageError::BackupNotFound(_))
        ));
    }

    #[test]
    fn test_unpublished_backup_invisible() {
        let (tmp, m) = setup();
        // A crashed backup: directory without meta.json
        fs::create_dir_all(tmp.path().join("backup/backup_partial")).unwrap();
        assert!(m.list_backups().unwrap().is_empty());

        assert_eq!(m.prune_orphans().unwrap(), 1);
        assert!(!tmp.path().join("backup/backup_partial").exists());
    }

    #[test]
    fn test_rotation_by_count() {
        let (_tmp, mut m) = setup();
        m.configure_rotation(BackupRotation {
            max_backups: 2,
            ..Default::default()
        });
        let first = m.create_backup(false).unwrap();
        let _second = m.create_backup(false).unwrap();
        let _third = m.create_backup(false).unwrap();

        let removed = m.rotate(None).unwrap();
        assert_eq!(removed, vec![first]);
        assert_eq!(m.list_backups().unwrap().len(), 2);
        assert!(m.within_limits());
    }

    #[test]
    fn test_rotation_by_free_space() {
        let (_tmp, mut m) = setup();
        m.configure_rotation(BackupRotation {
            max_backups: 10,
            min_free_space: 1024,
            ..Default::default()
        });
        let first = m.create_backup(false).unwrap();
        let _second = m.create_backup(false).unwrap();

        // Plenty of free space: nothing removed
        assert!(m.rotate(Some(10 * 1024)).unwrap().is_empty());

        // Under pressure the oldest goes first
        let removed = m.rotate(Some(0)).unwrap();
        assert!(removed.contains(&first));
    }

    #[test]
    fn test_incremental_skips_unchanged() {
        let (_tmp, mut m) = setup();
        let _full = m.create_backup(false).unwrap();

        // Nothing changed since the full backup
        let inc = m.create_backup(true).unwrap();
        let backups = m.list_backups().unwrap();
        let inc_meta = backups.iter().find(|b| b.id == inc).unwrap();
        assert!(inc_meta.incremental);
        assert_eq!(inc_meta.size, 0, "no files changed since the full backup");
    }

    #[test]
    fn test_backup_ids_unique() {
        let (_tmp, mut m) = setup();
        let a = m.create_backup(false).unwrap();
        let b = m.create_backup(false).unwrap();
        assert_ne!(a, b);
    }
}
