use std::sync::Arc;

use foreman_core::{Event, NewEvent, ProjectId};
use serde_json::Value;

use crate::StorageError;

/// Result of an append.
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    /// A new fact was written.
    Appended(Event),
    /// The idempotency key was already present; nothing was written.
    Duplicate { sequence: u64 },
}

impl AppendOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            AppendOutcome::Appended(e) => e.sequence,
            AppendOutcome::Duplicate { sequence } => *sequence,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            AppendOutcome::Appended(e) => Some(e),
            AppendOutcome::Duplicate { .. } => None,
        }
    }
}

/// A stored entry that failed verification and was left out of the replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptedEntry {
    pub sequence: u64,
    pub reason: String,
    pub content_hash: String,
}

/// Everything `read_all` could recover, in sequence order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Replay {
    pub events: Vec<Event>,
    pub corrupted: Vec<CorruptedEntry>,
}

/// Append-only, totally ordered fact store for one project.
///
/// `append` is the only mutator. Implementations detect a duplicate idempotency key before
/// assigning a sequence, never expose a partially written entry to `read_all`, and report
/// write failures as errors without leaving partial state behind.
pub trait EventLog: Send + Sync {
    fn project(&self) -> &ProjectId;
    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError>;
    fn read_all(&self) -> Result<Replay, StorageError>;
    /// Sequence of the event already stored under `key`, if any.
    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError>;
}

impl<L: EventLog + ?Sized> EventLog for Arc<L> {
    fn project(&self) -> &ProjectId {
        (**self).project()
    }

    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError> {
        (**self).append(event)
    }

    fn read_all(&self) -> Result<Replay, StorageError> {
        (**self).read_all()
    }

    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError> {
        (**self).sequence_for_key(key)
    }
}

/// Reject events addressed to another project.
pub fn ensure_project(log: &ProjectId, event: &NewEvent) -> Result<(), StorageError> {
    if &event.project != log {
        return Err(StorageError::ProjectMismatch { expected: log.clone(), got: event.project.clone() });
    }
    Ok(())
}

/// Verify an entry decoded from storage.
///
/// `raw_payload` is the payload exactly as stored; it must parse and the event checksum must
/// match. The returned entry records why it was rejected.
pub fn verify_entry(
    sequence: u64,
    raw_payload: &str,
    build: impl FnOnce(Value) -> Event,
) -> Result<Event, CorruptedEntry> {
    let content_hash = foreman_core::checksum::digest_hex(raw_payload.as_bytes());
    let payload: Value = match serde_json::from_str(raw_payload) {
        Ok(v) => v,
        Err(e) => {
            return Err(CorruptedEntry { sequence, reason: format!("payload is not json: {e}"), content_hash })
        }
    };
    let event = build(payload);
    if !foreman_core::checksum::verify(&event) {
        return Err(CorruptedEntry { sequence, reason: "checksum mismatch".into(), content_hash });
    }
    Ok(event)
}
