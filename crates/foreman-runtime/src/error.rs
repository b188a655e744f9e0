use foreman_core::{ProjectId, ValidationError};
use foreman_log::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The signal was rejected; nothing was logged.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Reading or appending failed; status was not advanced.
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("control loop for project {0} is not running")]
    Stopped(ProjectId),
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Storage(StorageError::Encode(e))
    }
}

impl OrchestratorError {
    pub fn is_validation(&self) -> bool {
        matches!(self, OrchestratorError::Validation(_))
    }
}
