//! Filesystem spool for async local uploads.
//!
//! Raw upload bytes are parked here between the synchronous enqueue and the
//! worker that renders them. Files land under date-sharded directories and
//! are swept by a periodic cleanup pass.

use chrono::Utc;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::error::{AppError, Result};

pub struct TempSpool {
    root: PathBuf,
}

impl TempSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Park an uploaded payload under its sanitized client file name.
    pub fn save_upload(&self, bytes: &[u8], name: &str) -> Result<PathBuf> {
        self.write(bytes, &sanitize_name(name))
    }

    /// Park a raw payload under a generated name with the given extension.
    pub fn save_bytes(&self, bytes: &[u8], ext: &str) -> Result<PathBuf> {
        self.write(bytes, &format!("blob.{}", sanitize_name(ext)))
    }

    fn write(&self, bytes: &[u8], suffix: &str) -> Result<PathBuf> {
        let now = Utc::now();
        let dir = self.root.join(now.format("%Y/%m/%d").to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::Spool(format!("cannot create {}: {e}", dir.display())))?;

        let token: u32 = rand::thread_rng().gen();
        let path = dir.join(format!("{}_{token:08x}_{suffix}", now.timestamp()));
        fs::write(&path, bytes)
            .map_err(|e| AppError::Spool(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Best-effort delete; a missing file is not worth failing over.
    pub fn delete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "spool delete failed");
        }
    }

    /// Remove files older than the cutoff, pruning emptied directories on
    /// the way out. Returns the number of files removed.
    pub fn cleanup(&self, older_than_hours: u64) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(older_than_hours.saturating_mul(3600)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;
        sweep(&self.root, cutoff, &mut deleted, false);
        deleted
    }
}

fn sweep(dir: &Path, cutoff: SystemTime, deleted: &mut usize, remove_self: bool) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep(&path, cutoff, deleted, true);
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if expired {
            match fs::remove_file(&path) {
                Ok(()) => *deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "spool cleanup failed"),
            }
        }
    }
    if remove_self {
        // Fails while the directory still has entries, which is exactly
        // the best-effort semantics wanted here.
        let _ = fs::remove_dir(dir);
    }
}

fn sanitize_name(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "upload".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_upload_lands_in_date_shard_with_sanitized_name() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TempSpool::new(dir.path());
        let path = spool.save_upload(b"bytes", "my photo (1).jpg").unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_my_photo__1_.jpg"));
        let shard = path.parent().unwrap().strip_prefix(dir.path()).unwrap();
        assert_eq!(shard.components().count(), 3);
    }

    #[test]
    fn save_bytes_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TempSpool::new(dir.path());
        let path = spool.save_bytes(b"bytes", "png").unwrap();
        assert!(path.to_str().unwrap().ends_with("_blob.png"));
    }

    #[test]
    fn delete_swallows_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TempSpool::new(dir.path());
        spool.delete(Path::new("/nonexistent/spool/file"));
    }

    #[test]
    fn cleanup_removes_expired_files_and_empty_shards() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TempSpool::new(dir.path());
        let path = spool.save_upload(b"bytes", "old.jpg").unwrap();

        // Fresh files survive a cutoff far in the past.
        assert_eq!(spool.cleanup(24), 0);
        assert!(path.exists());

        // A zero-hour cutoff expires everything written before this call.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(spool.cleanup(0), 1);
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }
}
