use thiserror::Error;

use crate::{Actor, TaskId};

/// A signal that is malformed or makes no sense in the current state. Never logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field is empty: {0}")]
    MissingField(&'static str),
    #[error("evidence lists neither files nor commands")]
    EmptyEvidence,
    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("task {0} was already published with different content")]
    TaskAlreadyPublished(TaskId),
    #[error("{actor:?} may not send {signal}")]
    ActorNotAllowed { actor: Actor, signal: &'static str },
    #[error("human verdict must be PASS or BLOCK")]
    InvalidHumanVerdict,
    #[error("command not applicable: {0}")]
    NotApplicable(String),
    #[error("invalid project id: {0}")]
    InvalidProject(String),
}
