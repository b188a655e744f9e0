//! Derived project status. Everything here is rebuilt by folding the event log.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::protocol::reason;
use crate::{EpochMs, EvidenceChain, ProjectId, RunId, TaskId, TaskSpec, Verdict, VerdictKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    Degraded,
    Halted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    WatchdogUnresponsive,
    Recovery,
    MultipleOpenRuns,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Created,
    Running,
    /// Every published task is DONE. A new task reopens the project.
    Finished,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogHealth {
    #[default]
    Healthy,
    Unresponsive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Dispatched,
    AwaitingVerdict,
    Done,
    NeedsHumanReview,
    Blocked,
    Canceled,
}

impl TaskState {
    /// States a task can only leave through an explicit requeue or resume.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Blocked | TaskState::Canceled
        )
    }

    /// States from which a requeue (policy retry, human retry, project resume) is legal.
    #[must_use]
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            TaskState::Blocked | TaskState::NeedsHumanReview | TaskState::Canceled
        )
    }
}

/// Conditions that hold a PENDING task back from dispatch in addition to its dependencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    AwaitingSkillDecision,
    AwaitingPolicyApproval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    VerdictPass,
    VerdictBlock,
    VerdictTimeout,
    StaleAfterRestart,
    Aborted,
    RecoveredClose,
    WorkerFailed,
    WorkerTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Open,
    Closed { reason: CloseReason },
}

impl RunState {
    pub fn is_open(&self) -> bool {
        matches!(self, RunState::Open)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub state: RunState,
    pub attempt: u32,
    pub started_at: EpochMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_at: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_verdict: Option<VerdictKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_timed_out_at: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_since: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<EpochMs>,
}

impl RunRecord {
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// The run already has an outcome that should have closed it.
    pub fn terminal_conditions_met(&self) -> bool {
        matches!(self.verdict, Some(VerdictKind::Pass | VerdictKind::Block))
            || self.human_verdict.is_some()
            || self.failure.is_some()
            || self.aborted
    }

    /// Close reason implied by the outcome already on record.
    pub fn implied_close_reason(&self) -> Option<CloseReason> {
        if self.aborted {
            return Some(CloseReason::Aborted);
        }
        if let Some(failure) = &self.failure {
            return Some(match failure.as_str() {
                reason::WORKER_TIMEOUT => CloseReason::WorkerTimeout,
                reason::STALE_AFTER_RESTART => CloseReason::StaleAfterRestart,
                _ => CloseReason::WorkerFailed,
            });
        }
        match self.human_verdict.or(self.verdict) {
            Some(VerdictKind::Pass) => Some(CloseReason::VerdictPass),
            Some(VerdictKind::Block) => Some(CloseReason::VerdictBlock),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: TaskState,
    #[serde(default)]
    pub gates: BTreeSet<Gate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run: Option<RunId>,
    #[serde(default)]
    pub runs: Vec<RunId>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evidence: Option<EvidenceChain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Last run whose outcome was reported through `RESULT_NOTIFIED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_run: Option<RunId>,
    pub updated_at: EpochMs,
}

impl TaskRecord {
    pub fn id(&self) -> &TaskId {
        &self.spec.task_id
    }

    pub fn last_run(&self) -> Option<&RunId> {
        self.runs.last()
    }

    /// The recorded auditor verdict, if it belongs to `run_id`.
    pub fn verdict_for(&self, run_id: &RunId) -> Option<&Verdict> {
        self.last_verdict.as_ref().filter(|v| &v.run_id == run_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ProjectHalted,
    WatchdogUnresponsive,
    VerdictTimeout,
    MultipleOpenRuns,
    CorruptedEntry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub message: String,
    pub sequence: u64,
}

/// A message that was logged but not acted on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Risk {
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub reason: String,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: u32,
    pub done: u32,
    pub blocked: u32,
    pub needs_review: u32,
    pub in_flight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project: ProjectId,
    pub mode: Mode,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<DegradedReason>,
    pub watchdog: WatchdogHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_restored_at: Option<EpochMs>,
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    pub runs: BTreeMap<RunId, RunRecord>,
    pub alerts: Vec<Alert>,
    pub risks: Vec<Risk>,
    pub progress: Progress,
    pub last_sequence: u64,
}

impl ProjectStatus {
    pub fn empty(project: ProjectId) -> Self {
        Self {
            project,
            mode: Mode::Normal,
            phase: Phase::Created,
            halt_reason: None,
            degraded_reason: None,
            watchdog: WatchdogHealth::Healthy,
            last_heartbeat_at: None,
            mode_restored_at: None,
            tasks: BTreeMap::new(),
            runs: BTreeMap::new(),
            alerts: Vec::new(),
            risks: Vec::new(),
            progress: Progress::default(),
            last_sequence: 0,
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn run(&self, run_id: &RunId) -> Option<&RunRecord> {
        self.runs.get(run_id)
    }

    /// The task's open run, if any.
    pub fn open_run(&self, task_id: &TaskId) -> Option<&RunRecord> {
        let task = self.tasks.get(task_id)?;
        let run = self.runs.get(task.current_run.as_ref()?)?;
        run.is_open().then_some(run)
    }

    pub fn open_runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.values().filter(|r| r.is_open())
    }

    pub fn open_runs_for(&self, task_id: &TaskId) -> usize {
        self.open_runs().filter(|r| &r.task_id == task_id).count()
    }

    pub fn is_halted(&self) -> bool {
        self.mode == Mode::Halted
    }

    /// All dependencies exist and are DONE.
    pub fn dependencies_met(&self, task: &TaskRecord) -> bool {
        task.spec.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|t| t.state == TaskState::Done)
                .unwrap_or(false)
        })
    }

    /// PENDING, ungated, dependencies met, nothing open.
    pub fn is_dispatchable(&self, task: &TaskRecord) -> bool {
        task.state == TaskState::Pending
            && task.gates.is_empty()
            && self.open_runs_for(task.id()) == 0
            && self.dependencies_met(task)
    }

    /// At least one task, all DONE, nothing open.
    pub fn all_tasks_done(&self) -> bool {
        !self.tasks.is_empty()
            && self.tasks.values().all(|t| t.state == TaskState::Done)
            && self.open_runs().next().is_none()
    }

    pub fn has_alert(&self, kind: AlertKind) -> bool {
        self.alerts.iter().any(|a| a.kind == kind)
    }
}
