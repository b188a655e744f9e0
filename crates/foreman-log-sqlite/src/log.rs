use std::path::Path;
use std::sync::Mutex;

use foreman_core::{Actor, Event, EventId, EventType, NewEvent, ProjectId, RunId, TaskId};
use foreman_log::{ensure_project, verify_entry, AppendOutcome, CorruptedEntry, EventLog, Replay, StorageError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};

fn db(e: rusqlite::Error) -> StorageError {
    StorageError::backend(e)
}

pub struct SqliteEventLog {
    project: ProjectId,
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Open or create the log at `db_path`. A database created for another project is refused.
    pub fn open(db_path: &Path, project: ProjectId) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io("create dir", parent, e))?;
        }
        let conn = Connection::open(db_path).map_err(db)?;
        // WAL keeps readers off the writer; FULL syncs the WAL on every commit before ack.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;").map_err(db)?;
        conn.execute_batch(include_str!("../migrations/0001_events.sql")).map_err(db)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES ('project', ?1)",
            params![project.as_str()],
        )
        .map_err(db)?;
        check_owner(&conn, &project)?;
        tracing::debug!(project = %project, path = %db_path.display(), "event log opened");
        Ok(Self { project, conn: Mutex::new(conn) })
    }

    /// Open an existing log without write access. `append` fails on such a handle.
    pub fn open_read_only(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(db)?;
        let project: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'project'", [], |r| r.get(0))
            .map_err(db)?;
        Ok(Self { project: ProjectId(project), conn: Mutex::new(conn) })
    }

    /// Number of stored rows, including any that fail verification.
    pub fn row_count(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)).map_err(db)?;
        Ok(n as u64)
    }
}

fn check_owner(conn: &Connection, project: &ProjectId) -> Result<(), StorageError> {
    let owner: String = conn
        .query_row("SELECT value FROM meta WHERE key = 'project'", [], |r| r.get(0))
        .map_err(db)?;
    if owner != project.as_str() {
        return Err(StorageError::ProjectMismatch { expected: ProjectId(owner), got: project.clone() });
    }
    Ok(())
}

struct Row {
    sequence: i64,
    event_id: String,
    project: String,
    event_type: String,
    actor: String,
    task_id: Option<String>,
    run_id: Option<String>,
    causation_id: Option<String>,
    payload: String,
    idempotency_key: String,
    timestamp: i64,
    checksum: String,
}

impl Row {
    fn decode(self) -> Result<Event, CorruptedEntry> {
        let sequence = self.sequence as u64;
        let actor: Option<Actor> = serde_json::from_value(serde_json::Value::String(self.actor.clone())).ok();
        let Some(actor) = actor else {
            return Err(CorruptedEntry {
                sequence,
                reason: format!("unknown actor '{}'", self.actor),
                content_hash: foreman_core::checksum::digest_hex(self.payload.as_bytes()),
            });
        };
        let Row { event_id, project, event_type, task_id, run_id, causation_id, payload, idempotency_key, timestamp, checksum, .. } = self;
        verify_entry(sequence, &payload, |payload| Event {
            sequence,
            event_id: EventId(event_id),
            event_type: EventType::from(event_type),
            actor,
            project: ProjectId(project),
            task_id: task_id.map(TaskId),
            run_id: run_id.map(RunId),
            causation_id: causation_id.map(EventId),
            payload,
            idempotency_key,
            timestamp,
            checksum: Some(checksum),
        })
    }
}

impl EventLog for SqliteEventLog {
    fn project(&self) -> &ProjectId {
        &self.project
    }

    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError> {
        ensure_project(&self.project, &event)?;
        let mut conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).map_err(db)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT sequence FROM events WHERE project = ?1 AND idempotency_key = ?2",
                params![event.project.as_str(), event.idempotency_key],
                |r| r.get(0),
            )
            .optional()
            .map_err(db)?;
        if let Some(sequence) = existing {
            return Ok(AppendOutcome::Duplicate { sequence: sequence as u64 });
        }

        let next: i64 = tx
            .query_row("SELECT COALESCE(MAX(sequence), 0) + 1 FROM events", [], |r| r.get(0))
            .map_err(db)?;
        let sealed = event.into_event(next as u64, EventId::generate())?;
        let payload = serde_json::to_string(&sealed.payload)?;
        tx.execute(
            "INSERT INTO events(sequence, event_id, project, event_type, actor, task_id, run_id, causation_id, payload, idempotency_key, timestamp, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                next,
                sealed.event_id.as_str(),
                sealed.project.as_str(),
                sealed.event_type.as_str(),
                sealed.actor.as_str(),
                sealed.task_id.as_ref().map(|t| t.as_str()),
                sealed.run_id.as_ref().map(|r| r.as_str()),
                sealed.causation_id.as_ref().map(|c| c.as_str()),
                payload,
                sealed.idempotency_key,
                sealed.timestamp,
                sealed.checksum.as_deref().unwrap_or_default(),
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(AppendOutcome::Appended(sealed))
    }

    fn read_all(&self) -> Result<Replay, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence, event_id, project, event_type, actor, task_id, run_id, causation_id, payload, idempotency_key, timestamp, checksum
                 FROM events ORDER BY sequence",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Row {
                    sequence: r.get(0)?,
                    event_id: r.get(1)?,
                    project: r.get(2)?,
                    event_type: r.get(3)?,
                    actor: r.get(4)?,
                    task_id: r.get(5)?,
                    run_id: r.get(6)?,
                    causation_id: r.get(7)?,
                    payload: r.get(8)?,
                    idempotency_key: r.get(9)?,
                    timestamp: r.get(10)?,
                    checksum: r.get(11)?,
                })
            })
            .map_err(db)?;

        let mut replay = Replay::default();
        for row in rows {
            match row.map_err(db)?.decode() {
                Ok(event) => replay.events.push(event),
                Err(bad) => {
                    tracing::warn!(project = %self.project, sequence = bad.sequence, reason = %bad.reason, "corrupted log entry");
                    replay.corrupted.push(bad);
                }
            }
        }
        Ok(replay)
    }

    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT sequence FROM events WHERE project = ?1 AND idempotency_key = ?2",
                params![self.project.as_str(), key],
                |r| r.get(0),
            )
            .optional()
            .map_err(db)?;
        Ok(seq.map(|s| s as u64))
    }
}
