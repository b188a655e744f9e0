use std::path::PathBuf;

use foreman_core::ProjectId;
use thiserror::Error;

/// The log could not be read or written. Fatal to the operation that hit it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("log belongs to project {expected}, refused event for {got}")]
    ProjectMismatch { expected: ProjectId, got: ProjectId },
    #[error("log lock poisoned")]
    Poisoned,
    #[error("log unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io { op, path: path.into(), source }
    }

    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Backend(Box::new(e))
    }
}
