use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use foreman_core::ProjectStatus;

use crate::StorageError;

/// On-disk copy of the derived status for external readers.
///
/// Written with temp file, fsync, rename so readers see either the old or the new snapshot.
/// Recovery never reads it back; the log is the only source of truth.
#[derive(Clone, Debug)]
pub struct StatusCache {
    path: PathBuf,
}

impl StatusCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, status: &ProjectStatus) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create dir", parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(status)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StorageError::io("open", &tmp, e))?;
            f.write_all(&bytes).map_err(|e| StorageError::io("write", &tmp, e))?;
            f.sync_all().map_err(|e| StorageError::io("fsync", &tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io("rename", &self.path, e))?;
        if let Some(parent) = self.path.parent() {
            // Persist the rename itself. Not every platform lets a directory be opened.
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        tracing::debug!(path = %self.path.display(), sequence = status.last_sequence, "status cache written");
        Ok(())
    }

    /// Last written snapshot, for display only.
    pub fn read(&self) -> Result<Option<ProjectStatus>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io("read", &self.path, e)),
        }
    }

    /// The cache is disposable.
    pub fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", &self.path, e)),
        }
    }
}
