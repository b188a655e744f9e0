//! Inbound collaborator signals. Every role's message is a variant of [`Signal`] and goes
//! through one validation path.

use serde::{Deserialize, Serialize};

use crate::{Actor, EvidenceChain, RunId, TaskId, TaskSpec, ValidationError, Verdict, VerdictKind};

/// A worker reporting that it could not finish a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Decisions only a human may take.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HumanCommand {
    SelectSkill {
        task_id: TaskId,
        skill: String,
    },
    ApproveTier {
        task_id: TaskId,
        tier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Resolve a run waiting on review with PASS or BLOCK.
    OverrideVerdict {
        task_id: TaskId,
        run_id: RunId,
        verdict: VerdictKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ResumeProject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    RestoreMode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    RetryTask {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    AbortRun {
        task_id: TaskId,
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl HumanCommand {
    pub fn name(&self) -> &'static str {
        match self {
            HumanCommand::SelectSkill { .. } => "select_skill",
            HumanCommand::ApproveTier { .. } => "approve_tier",
            HumanCommand::OverrideVerdict { .. } => "override_verdict",
            HumanCommand::ResumeProject { .. } => "resume_project",
            HumanCommand::RestoreMode { .. } => "restore_mode",
            HumanCommand::RetryTask { .. } => "retry_task",
            HumanCommand::AbortRun { .. } => "abort_run",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    TaskSpec(TaskSpec),
    Evidence(EvidenceChain),
    Verdict(Verdict),
    RunFailed(RunFailure),
    Human(HumanCommand),
    Ping,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::TaskSpec(_) => "task_spec",
            Signal::Evidence(_) => "evidence",
            Signal::Verdict(_) => "verdict",
            Signal::RunFailed(_) => "run_failed",
            Signal::Human(cmd) => cmd.name(),
            Signal::Ping => "ping",
        }
    }

    /// Task and run a run-scoped signal refers to.
    pub fn run_ref(&self) -> Option<(&TaskId, &RunId)> {
        match self {
            Signal::Evidence(e) => Some((&e.task_id, &e.run_id)),
            Signal::Verdict(v) => Some((&v.task_id, &v.run_id)),
            Signal::RunFailed(f) => Some((&f.task_id, &f.run_id)),
            Signal::Human(HumanCommand::OverrideVerdict { task_id, run_id, .. })
            | Signal::Human(HumanCommand::AbortRun { task_id, run_id, .. }) => Some((task_id, run_id)),
            _ => None,
        }
    }

    fn allowed(&self, actor: Actor) -> bool {
        match self {
            Signal::TaskSpec(_) => matches!(actor, Actor::Planner | Actor::Human),
            Signal::Evidence(_) | Signal::RunFailed(_) => actor == Actor::Worker,
            Signal::Verdict(_) | Signal::Ping => actor == Actor::Auditor,
            Signal::Human(_) => actor == Actor::Human,
        }
    }
}

/// What arrives at the control loop boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub actor: Actor,
    /// Optional caller-chosen key; namespaced under the project before use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(actor: Actor, signal: Signal) -> Self {
        Self { actor, idempotency_key: None, signal }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(())
    }
}

/// Context-free checks: required fields and actor/variant pairing.
pub fn validate_shape(envelope: &SignalEnvelope) -> Result<(), ValidationError> {
    let signal = &envelope.signal;
    if !signal.allowed(envelope.actor) {
        return Err(ValidationError::ActorNotAllowed { actor: envelope.actor, signal: signal.name() });
    }
    if let Some(key) = &envelope.idempotency_key {
        require(key, "idempotencyKey")?;
    }
    if let Some((task_id, run_id)) = signal.run_ref() {
        require(task_id.as_str(), "taskId")?;
        require(run_id.as_str(), "runId")?;
    }

    match signal {
        Signal::TaskSpec(spec) => {
            require(spec.task_id.as_str(), "taskId")?;
            require(&spec.goal, "goal")?;
            if spec.acceptance.iter().all(|a| a.trim().is_empty()) {
                return Err(ValidationError::MissingField("acceptance"));
            }
            if spec.dependencies.contains(&spec.task_id) {
                return Err(ValidationError::SelfDependency(spec.task_id.clone()));
            }
            if spec.dependencies.iter().any(|d| d.is_blank()) {
                return Err(ValidationError::MissingField("dependencies"));
            }
        }
        Signal::Evidence(evidence) => {
            if evidence.files.is_empty() && evidence.commands.is_empty() {
                return Err(ValidationError::EmptyEvidence);
            }
            if evidence.commands.iter().any(|c| c.cmd.trim().is_empty()) {
                return Err(ValidationError::MissingField("commands.cmd"));
            }
            require(&evidence.path_safety.pwd, "pathSafety.pwd")?;
            require(&evidence.path_safety.repo_root, "pathSafety.repoRoot")?;
        }
        Signal::Verdict(_) => {}
        Signal::RunFailed(failure) => require(&failure.reason, "reason")?,
        Signal::Human(cmd) => match cmd {
            HumanCommand::SelectSkill { task_id, skill } => {
                require(task_id.as_str(), "taskId")?;
                require(skill, "skill")?;
            }
            HumanCommand::ApproveTier { task_id, tier, .. } => {
                require(task_id.as_str(), "taskId")?;
                require(tier, "tier")?;
            }
            HumanCommand::OverrideVerdict { verdict, .. } => {
                if *verdict == VerdictKind::Warn {
                    return Err(ValidationError::InvalidHumanVerdict);
                }
            }
            HumanCommand::RetryTask { task_id, .. } => require(task_id.as_str(), "taskId")?,
            HumanCommand::ResumeProject { .. }
            | HumanCommand::RestoreMode { .. }
            | HumanCommand::AbortRun { .. } => {}
        },
        Signal::Ping => {}
    }
    Ok(())
}
