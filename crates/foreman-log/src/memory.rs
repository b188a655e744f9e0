use std::collections::HashMap;
use std::sync::Mutex;

use foreman_core::{EventId, NewEvent, ProjectId};

use crate::traits::{ensure_project, AppendOutcome, EventLog, Replay};
use crate::StorageError;

/// In-memory log for tests and throwaway projects. Not durable.
pub struct InMemoryEventLog {
    project: ProjectId,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: Vec<foreman_core::Event>,
    keys: HashMap<String, u64>,
}

impl InMemoryEventLog {
    pub fn new(project: ProjectId) -> Self {
        Self { project, inner: Mutex::new(Inner::default()) }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventLog for InMemoryEventLog {
    fn project(&self) -> &ProjectId {
        &self.project
    }

    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError> {
        ensure_project(&self.project, &event)?;
        let mut inner = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        if let Some(seq) = inner.keys.get(&event.idempotency_key) {
            return Ok(AppendOutcome::Duplicate { sequence: *seq });
        }
        let sequence = inner.events.len() as u64 + 1;
        let key = event.idempotency_key.clone();
        let sealed = event.into_event(sequence, EventId::generate())?;
        inner.keys.insert(key, sequence);
        inner.events.push(sealed.clone());
        Ok(AppendOutcome::Appended(sealed))
    }

    fn read_all(&self) -> Result<Replay, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(Replay { events: inner.events.clone(), corrupted: Vec::new() })
    }

    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(inner.keys.get(key).copied())
    }
}
