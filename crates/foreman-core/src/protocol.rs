//! Payloads produced by the external collaborators.
//!
//! The orchestrator treats most of these fields as opaque. Only identity fields,
//! presence checks, and the path-safety report are interpreted.

use serde::{Deserialize, Serialize};

use crate::{RunId, TaskId};

/// Work category declared by the planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Coding,
    BuildTest,
    Docs,
    Research,
    Ops,
    Design,
    Comms,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Immutable unit of work. Superseded by publishing a new `task_id`, never edited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub goal: String,
    pub kind: TaskKind,
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_skill: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceCommand {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Where the worker ran and what it changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSafety {
    pub pwd: String,
    pub repo_root: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

/// The worker's own assessment of the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    #[default]
    Done,
    Blocked,
}

/// Worker's claim that a run is complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceChain {
    pub task_id: TaskId,
    pub run_id: RunId,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub commands: Vec<EvidenceCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_command: Option<String>,
    pub path_safety: PathSafety,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub status: EvidenceStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Pass,
    Warn,
    Block,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictKind::Pass => "PASS",
            VerdictKind::Warn => "WARN",
            VerdictKind::Block => "BLOCK",
        }
    }
}

/// Auditor's judgement on the evidence of one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub verdict: VerdictKind,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Reason codes with a fixed meaning to the policy gate.
pub mod reason {
    pub const PATH_OUTSIDE_PROJECT: &str = "path_outside_project";
    pub const DENY_COMMAND_USED: &str = "deny_command_used";
    pub const DENY_PATH_TOUCHED: &str = "deny_path_touched";
    pub const STALE_AFTER_RESTART: &str = "stale_after_restart";
    pub const WORKER_TIMEOUT: &str = "worker_timeout";
    pub const DISPATCH_FAILED: &str = "dispatch_failed";
}
