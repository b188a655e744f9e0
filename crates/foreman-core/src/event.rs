use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EpochMs, EventId, ProjectId, RunId, TaskId};

/// Who a fact is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Orchestrator,
    Planner,
    Worker,
    Auditor,
    Human,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Orchestrator => "orchestrator",
            Actor::Planner => "planner",
            Actor::Worker => "worker",
            Actor::Auditor => "auditor",
            Actor::Human => "human",
        }
    }
}

macro_rules! event_types {
    ($($variant:ident => $wire:literal,)*) => {
        /// Event type tag. Types this build does not know survive a round trip as `Other`.
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum EventType {
            $($variant,)*
            Other(String),
        }

        impl EventType {
            pub fn as_str(&self) -> &str {
                match self {
                    $(EventType::$variant => $wire,)*
                    EventType::Other(s) => s.as_str(),
                }
            }
        }

        impl From<String> for EventType {
            fn from(s: String) -> Self {
                match s.as_str() {
                    $($wire => EventType::$variant,)*
                    _ => EventType::Other(s),
                }
            }
        }
    };
}

event_types! {
    ProjectStarted => "PROJECT_STARTED",
    ProjectHalted => "PROJECT_HALTED",
    ProjectResumed => "PROJECT_RESUMED",
    ProjectModeRestored => "PROJECT_MODE_RESTORED",
    TaskspecPublished => "TASKSPEC_PUBLISHED",
    TaskSkillSet => "TASK_SKILL_SET",
    PolicyTierRequested => "POLICY_TIER_REQUESTED",
    PolicyTierApproved => "POLICY_TIER_APPROVED",
    WorkerRunIntent => "WORKER_RUN_INTENT",
    WorkerRunStarted => "WORKER_RUN_STARTED",
    WorkerRunFailed => "WORKER_RUN_FAILED",
    WorkerRunAborted => "WORKER_RUN_ABORTED",
    EvidenceSubmitted => "EVIDENCE_SUBMITTED",
    WatchdogVerdict => "WATCHDOG_VERDICT",
    HumanVerdict => "HUMAN_VERDICT",
    VerdictTimeout => "VERDICT_TIMEOUT",
    ReviewRequested => "REVIEW_REQUESTED",
    RunClosed => "RUN_CLOSED",
    TaskRequeued => "TASK_REQUEUED",
    WatchdogHeartbeat => "WATCHDOG_HEARTBEAT",
    WatchdogUnresponsive => "WATCHDOG_UNRESPONSIVE",
    MessageIgnored => "MESSAGE_IGNORED",
    CorruptedEntryDetected => "CORRUPTED_ENTRY_DETECTED",
    RecoveryStarted => "RECOVERY_STARTED",
    ProjectFinished => "PROJECT_FINISHED",
    ResultNotified => "RESULT_NOTIFIED",
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An appended, immutable fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sequence: u64,
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: Actor,
    pub project: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    #[serde(default)]
    pub payload: Value,
    pub idempotency_key: String,
    pub timestamp: EpochMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Event {
    /// Decode the payload. A payload that does not match `T` yields `None`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// An event proposed by the control loop, before the log assigns sequence, id and checksum.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub actor: Actor,
    pub project: ProjectId,
    pub task_id: Option<TaskId>,
    pub run_id: Option<RunId>,
    pub causation_id: Option<EventId>,
    pub payload: Value,
    pub idempotency_key: String,
    pub timestamp: EpochMs,
}

impl NewEvent {
    pub fn new(project: &ProjectId, event_type: EventType, actor: Actor, timestamp: EpochMs) -> Self {
        Self {
            event_type,
            actor,
            project: project.clone(),
            task_id: None,
            run_id: None,
            causation_id: None,
            payload: Value::Object(Default::default()),
            idempotency_key: String::new(),
            timestamp,
        }
    }

    pub fn task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }

    pub fn run(mut self, run_id: &RunId) -> Self {
        self.run_id = Some(run_id.clone());
        self
    }

    pub fn caused_by(mut self, event_id: &EventId) -> Self {
        self.causation_id = Some(event_id.clone());
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Derive the idempotency key from project, task, run and type, unless one is already set.
    pub fn derive_key(mut self) -> Self {
        if self.idempotency_key.is_empty() {
            let mut key = self.project.0.clone();
            if let Some(task) = &self.task_id {
                key.push(':');
                key.push_str(task.as_str());
            }
            if let Some(run) = &self.run_id {
                key.push(':');
                key.push_str(run.as_str());
            }
            key.push(':');
            key.push_str(self.event_type.as_str());
            self.idempotency_key = key;
        }
        self
    }

    /// Seal into a log entry. Only event logs call this.
    pub fn into_event(self, sequence: u64, event_id: EventId) -> Result<Event, serde_json::Error> {
        let mut event = Event {
            sequence,
            event_id,
            event_type: self.event_type,
            actor: self.actor,
            project: self.project,
            task_id: self.task_id,
            run_id: self.run_id,
            causation_id: self.causation_id,
            payload: self.payload,
            idempotency_key: self.idempotency_key,
            timestamp: self.timestamp,
            checksum: None,
        };
        event.checksum = Some(crate::checksum::event_checksum(&event)?);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_event_types_survive_round_trip() {
        let t: EventType = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(t, EventType::Other("SOMETHING_NEW".into()));
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"SOMETHING_NEW\"");

        let known: EventType = serde_json::from_str("\"RUN_CLOSED\"").unwrap();
        assert_eq!(known, EventType::RunClosed);
    }

    #[test]
    fn derived_keys_follow_scope() {
        let p = ProjectId::from("demo");
        let e = NewEvent::new(&p, EventType::EvidenceSubmitted, Actor::Worker, 0)
            .task(&TaskId::from("T1"))
            .run(&RunId::from("r-1"))
            .derive_key();
        assert_eq!(e.idempotency_key, "demo:T1:r-1:EVIDENCE_SUBMITTED");

        let explicit = NewEvent::new(&p, EventType::ProjectResumed, Actor::Human, 0)
            .key("demo:human:abc")
            .derive_key();
        assert_eq!(explicit.idempotency_key, "demo:human:abc");
    }

    #[test]
    fn sealing_attaches_a_verifiable_checksum() {
        let p = ProjectId::from("demo");
        let event = NewEvent::new(&p, EventType::ProjectStarted, Actor::Orchestrator, 42)
            .payload(&json!({"restart": false}))
            .unwrap()
            .derive_key()
            .into_event(1, EventId::from("e-1"))
            .unwrap();
        assert!(crate::checksum::verify(&event));

        let mut tampered = event.clone();
        tampered.timestamp = 43;
        assert!(!crate::checksum::verify(&tampered));
    }
}
