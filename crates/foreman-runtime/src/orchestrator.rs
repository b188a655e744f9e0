//! The per-project control loop.
//!
//! [`Orchestrator`] is the only writer of a project's log. Every change, whether a signal, a
//! timer firing, a dispatch or a restart repair, goes through one append path, which
//! applies the reducer only after the log accepted the event.

use std::collections::BTreeSet;
use std::sync::Arc;

use foreman_core::payload;
use foreman_core::policy::{self, RetryDecision, VerdictDecision};
use foreman_core::protocol::reason;
use foreman_core::{
    checksum, reduce, reducer, validate_shape, Actor, CloseReason, EpochMs, Event, EventId, EventType,
    EvidenceChain, Gate, HumanCommand, NewEvent, Phase, ProjectId, ProjectStatus, RiskLevel, RunFailure,
    RunId, Signal, SignalEnvelope, TaskId, TaskRecord, TaskSpec, TaskState, ValidationError, Verdict,
    VerdictKind, WatchdogHealth,
};
use foreman_log::{AppendOutcome, CorruptedEntry, EventLog, StatusCache};
use serde::{Deserialize, Serialize};

use crate::{
    Clock, DispatchRequest, LogOnlyDispatcher, LogOnlyNotifier, OrchestratorConfig, OrchestratorError,
    ResultNotifier, SystemClock, TaskResult, WorkerDispatcher,
};

/// What became of an accepted signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Appended { sequence: u64 },
    /// The idempotency key was already in the log.
    Duplicate { sequence: u64 },
    /// Logged as `MESSAGE_IGNORED`; nothing else changed.
    Ignored { sequence: u64 },
    /// A ping folded into the in-memory heartbeat without a write.
    Coalesced,
}

impl Outcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Outcome::Appended { sequence } | Outcome::Duplicate { sequence } | Outcome::Ignored { sequence } => {
                Some(*sequence)
            }
            Outcome::Coalesced => None,
        }
    }
}

impl From<&AppendOutcome> for Outcome {
    fn from(outcome: &AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Appended(e) => Outcome::Appended { sequence: e.sequence },
            AppendOutcome::Duplicate { sequence } => Outcome::Duplicate { sequence: *sequence },
        }
    }
}

enum RunCheck {
    Live,
    Ignored(Outcome),
}

/// Runs that were open when the loop started and had no outcome yet.
struct RestartWatch {
    began_at: EpochMs,
    runs: BTreeSet<RunId>,
}

pub struct OrchestratorBuilder {
    log: Box<dyn EventLog>,
    clock: Arc<dyn Clock>,
    dispatcher: Box<dyn WorkerDispatcher>,
    notifier: Box<dyn ResultNotifier>,
    config: OrchestratorConfig,
    cache: Option<StatusCache>,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn dispatcher(mut self, dispatcher: impl WorkerDispatcher + 'static) -> Self {
        self.dispatcher = Box::new(dispatcher);
        self
    }

    pub fn notifier(mut self, notifier: impl ResultNotifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn status_cache(mut self, cache: StatusCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replay the log and reconcile it: record corrupted entries, mark the project started,
    /// close runs whose outcome is already on record and start watching the rest. Follow-ups
    /// and notifications lost to a crash are written before the first dispatch.
    pub fn open(self) -> Result<Orchestrator, OrchestratorError> {
        let project = self.log.project().clone();
        let replay = self.log.read_all()?;
        let restart = !replay.events.is_empty() || !replay.corrupted.is_empty();
        let status = reduce(&project, &replay.events);
        let started_at = self.clock.now_ms();
        tracing::info!(
            project = %project,
            events = replay.events.len(),
            corrupted = replay.corrupted.len(),
            last_sequence = status.last_sequence,
            "log replayed"
        );

        let mut orch = Orchestrator {
            project,
            log: self.log,
            clock: self.clock,
            dispatcher: self.dispatcher,
            notifier: self.notifier,
            config: self.config,
            cache: self.cache,
            status,
            started_at,
            last_ping: None,
            restart_watch: None,
        };
        orch.record_corruption(&replay.corrupted)?;
        let started = orch
            .event(EventType::ProjectStarted, Actor::Orchestrator)
            .payload(&payload::ProjectStarted { restart })?
            .key(format!("{}:PROJECT_STARTED", orch.project));
        orch.append(started)?;
        orch.reconcile()?;
        orch.follow_through()?;
        orch.write_cache();
        Ok(orch)
    }
}

pub struct Orchestrator {
    project: ProjectId,
    log: Box<dyn EventLog>,
    clock: Arc<dyn Clock>,
    dispatcher: Box<dyn WorkerDispatcher>,
    notifier: Box<dyn ResultNotifier>,
    config: OrchestratorConfig,
    cache: Option<StatusCache>,
    status: ProjectStatus,
    started_at: EpochMs,
    /// Latest auditor ping, persisted or not.
    last_ping: Option<EpochMs>,
    restart_watch: Option<RestartWatch>,
}

impl Orchestrator {
    pub fn builder(log: impl EventLog + 'static) -> OrchestratorBuilder {
        OrchestratorBuilder {
            log: Box::new(log),
            clock: Arc::new(SystemClock),
            dispatcher: Box::new(LogOnlyDispatcher),
            notifier: Box::new(LogOnlyNotifier),
            config: OrchestratorConfig::default(),
            cache: None,
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn status(&self) -> &ProjectStatus {
        &self.status
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> Result<Vec<Event>, OrchestratorError> {
        Ok(self.log.read_all()?.events)
    }

    /// Fold the log from scratch, ignoring in-memory state.
    pub fn rebuild_status(&self) -> Result<ProjectStatus, OrchestratorError> {
        Ok(reduce(&self.project, &self.log.read_all()?.events))
    }

    /// Validate a signal against current status and record what it means.
    ///
    /// Shape errors and out-of-context commands are returned as `Validation` and leave the
    /// log untouched. Stale run-scoped signals are logged as `MESSAGE_IGNORED`.
    pub fn accept(&mut self, envelope: SignalEnvelope) -> Result<Outcome, OrchestratorError> {
        if let Err(e) = validate_shape(&envelope) {
            tracing::warn!(
                project = %self.project,
                actor = envelope.actor.as_str(),
                signal = envelope.signal.name(),
                error = %e,
                "signal rejected"
            );
            return Err(e.into());
        }
        if let Some(key) = self.caller_key(&envelope) {
            if let Some(sequence) = self.log.sequence_for_key(&key)? {
                tracing::debug!(project = %self.project, key = %key, sequence, "duplicate signal");
                return Ok(Outcome::Duplicate { sequence });
            }
        }

        let before = self.status.last_sequence;
        let outcome = match self.route(&envelope) {
            Ok(o) => o,
            Err(e) => {
                if e.is_validation() {
                    tracing::warn!(
                        project = %self.project,
                        actor = envelope.actor.as_str(),
                        signal = envelope.signal.name(),
                        error = %e,
                        "signal rejected"
                    );
                }
                return Err(e);
            }
        };
        self.follow_through()?;
        if self.status.last_sequence != before {
            self.write_cache();
        }
        Ok(outcome)
    }

    /// Fire due timers, then follow through. Returns how far the log advanced.
    pub fn tick(&mut self) -> Result<u64, OrchestratorError> {
        let before = self.status.last_sequence;
        let now = self.clock.now_ms();
        self.watch_heartbeat(now)?;
        self.watch_restart(now)?;
        self.watch_verdicts(now)?;
        self.watch_workers(now)?;
        self.expire_reviews(now)?;
        self.follow_through()?;
        let advanced = self.status.last_sequence - before;
        if advanced > 0 {
            self.write_cache();
        }
        Ok(advanced)
    }

    /// Everything that follows from the current status without a new signal: repair runs an
    /// earlier failed write left unfinished, dispatch, report results and mark the project
    /// finished.
    fn follow_through(&mut self) -> Result<(), OrchestratorError> {
        self.settle_outstanding()?;
        self.dispatch_ready()?;
        self.report_results()?;
        self.finish_if_complete()
    }

    /// Start a run for every dispatchable task, in task id order, up to the open-run limit.
    pub fn dispatch_ready(&mut self) -> Result<usize, OrchestratorError> {
        if self.status.is_halted() {
            return Ok(0);
        }
        let open = self.status.open_runs().count();
        let capacity = self.config.dispatch.max_open_runs.saturating_sub(open);
        let ready: Vec<TaskId> = self
            .status
            .tasks
            .values()
            .filter(|t| self.status.is_dispatchable(t))
            .map(|t| t.id().clone())
            .take(capacity)
            .collect();
        for task_id in &ready {
            self.dispatch(task_id)?;
        }
        Ok(ready.len())
    }

    fn route(&mut self, envelope: &SignalEnvelope) -> Result<Outcome, OrchestratorError> {
        match &envelope.signal {
            Signal::TaskSpec(spec) => self.publish_task(envelope, spec),
            Signal::Evidence(evidence) => self.receive_evidence(envelope, evidence),
            Signal::Verdict(verdict) => self.receive_verdict(envelope, verdict),
            Signal::RunFailed(failure) => self.receive_failure(envelope, failure),
            Signal::Human(command) => self.human(envelope, command),
            Signal::Ping => self.ping(),
        }
    }

    fn caller_key(&self, envelope: &SignalEnvelope) -> Option<String> {
        match (&envelope.signal, &envelope.idempotency_key) {
            (Signal::Human(_), Some(key)) => Some(format!("{}:human:{key}", self.project)),
            _ => None,
        }
    }

    fn event(&self, event_type: EventType, actor: Actor) -> NewEvent {
        NewEvent::new(&self.project, event_type, actor, self.clock.now_ms())
    }

    /// The single append path.
    fn append(&mut self, event: NewEvent) -> Result<AppendOutcome, OrchestratorError> {
        let outcome = match self.log.append(event.derive_key()) {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(project = %self.project, error = %e, "append failed");
                return Err(e.into());
            }
        };
        match &outcome {
            AppendOutcome::Appended(e) => {
                reducer::apply(&mut self.status, e);
                tracing::info!(
                    project = %self.project,
                    sequence = e.sequence,
                    event_type = %e.event_type,
                    task_id = e.task_id.as_ref().map(TaskId::as_str).unwrap_or("-"),
                    run_id = e.run_id.as_ref().map(RunId::as_str).unwrap_or("-"),
                    "event appended"
                );
            }
            AppendOutcome::Duplicate { sequence } => {
                tracing::debug!(project = %self.project, sequence, "duplicate append skipped");
            }
        }
        Ok(outcome)
    }

    fn write_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write(&self.status) {
                tracing::warn!(project = %self.project, error = %e, "status cache write failed");
            }
        }
    }

    fn require_task(&self, task_id: &TaskId) -> Result<&TaskRecord, ValidationError> {
        self.status
            .task(task_id)
            .ok_or_else(|| ValidationError::UnknownTask(task_id.clone()))
    }

    /// Is `run_id` the task's open run? If not, log the signal as ignored.
    fn check_run(
        &mut self,
        envelope: &SignalEnvelope,
        task_id: &TaskId,
        run_id: &RunId,
    ) -> Result<RunCheck, OrchestratorError> {
        self.require_task(task_id)?;
        let expected = self.status.open_run(task_id).map(|r| r.run_id.clone());
        if expected.as_ref() == Some(run_id) {
            return Ok(RunCheck::Live);
        }
        let why = if expected.is_some() { "run_mismatch" } else { "no_open_run" };
        self.ignore(envelope, task_id, expected, run_id, why).map(RunCheck::Ignored)
    }

    fn ignore(
        &mut self,
        envelope: &SignalEnvelope,
        task_id: &TaskId,
        expected: Option<RunId>,
        received: &RunId,
        why: &str,
    ) -> Result<Outcome, OrchestratorError> {
        tracing::warn!(
            project = %self.project,
            task_id = %task_id,
            received_run_id = %received,
            expected_run_id = expected.as_ref().map(RunId::as_str).unwrap_or("-"),
            signal = envelope.signal.name(),
            reason = why,
            "signal ignored"
        );
        // Redelivery of the same stale message is recorded once.
        let digest = checksum::digest_hex(&serde_json::to_vec(envelope)?);
        let event = self
            .event(EventType::MessageIgnored, Actor::Orchestrator)
            .task(task_id)
            .payload(&payload::MessageIgnored {
                actor: envelope.actor,
                expected_run_id: expected,
                received_run_id: received.clone(),
                message_type: envelope.signal.name().to_string(),
                reason: why.to_string(),
            })?
            .key(format!("{}:MESSAGE_IGNORED:{digest}", self.project));
        let outcome = self.append(event)?;
        Ok(Outcome::Ignored { sequence: outcome.sequence() })
    }

    fn publish_task(&mut self, envelope: &SignalEnvelope, spec: &TaskSpec) -> Result<Outcome, OrchestratorError> {
        if let Some(existing) = self.status.task(&spec.task_id) {
            if existing.spec != *spec {
                return Err(ValidationError::TaskAlreadyPublished(spec.task_id.clone()).into());
            }
        }
        let needs_tier =
            spec.risk_level == RiskLevel::High && self.config.dispatch.require_tier_approval_for_high_risk;
        let mut gates = Vec::new();
        if self.config.dispatch.require_skill_decision && spec.preferred_skill.is_none() {
            gates.push(Gate::AwaitingSkillDecision);
        }
        if needs_tier {
            gates.push(Gate::AwaitingPolicyApproval);
        }
        let event = self
            .event(EventType::TaskspecPublished, envelope.actor)
            .task(&spec.task_id)
            .payload(&payload::TaskPublished { spec: spec.clone(), gates })?;
        let outcome = self.append(event)?;

        if let (AppendOutcome::Appended(published), true) = (&outcome, needs_tier) {
            let request = self
                .event(EventType::PolicyTierRequested, Actor::Orchestrator)
                .task(&spec.task_id)
                .caused_by(&published.event_id)
                .payload(&payload::TierRequested {
                    tier: self.config.dispatch.high_risk_tier.clone(),
                    reason: "high risk task".to_string(),
                })?;
            self.append(request)?;
        }
        Ok(Outcome::from(&outcome))
    }

    fn receive_evidence(
        &mut self,
        envelope: &SignalEnvelope,
        evidence: &EvidenceChain,
    ) -> Result<Outcome, OrchestratorError> {
        if let RunCheck::Ignored(o) = self.check_run(envelope, &evidence.task_id, &evidence.run_id)? {
            return Ok(o);
        }
        let event = self
            .event(EventType::EvidenceSubmitted, envelope.actor)
            .task(&evidence.task_id)
            .run(&evidence.run_id)
            .payload(&payload::EvidenceSubmitted { evidence: evidence.clone() })?;
        let outcome = self.append(event)?;
        let cause = outcome.event().map(|e| e.event_id.clone());
        self.screen(&evidence.run_id, cause.as_ref())?;
        Ok(Outcome::from(&outcome))
    }

    /// Screen the evidence recorded for an open, unjudged run and record a BLOCK if it
    /// breaks policy.
    fn screen(&mut self, run_id: &RunId, cause: Option<&EventId>) -> Result<(), OrchestratorError> {
        let Some(run) = self.status.run(run_id) else { return Ok(()) };
        if !run.is_open() || run.evidence_at.is_none() || run.verdict.is_some() || run.terminal_conditions_met() {
            return Ok(());
        }
        let Some(evidence) = self
            .status
            .task(&run.task_id)
            .and_then(|t| t.last_evidence.as_ref())
            .filter(|e| &e.run_id == run_id)
        else {
            return Ok(());
        };
        let violations = policy::screen_evidence(evidence, &self.config.policy);
        let Some(block) = policy::verdict_from_violations(evidence, &violations) else { return Ok(()) };
        tracing::warn!(
            project = %self.project,
            task_id = %block.task_id,
            run_id = %block.run_id,
            reasons = ?block.reasons,
            "evidence failed screening"
        );
        self.record_verdict(block, Actor::Orchestrator, cause)?;
        Ok(())
    }

    fn receive_verdict(&mut self, envelope: &SignalEnvelope, verdict: &Verdict) -> Result<Outcome, OrchestratorError> {
        if let RunCheck::Ignored(o) = self.check_run(envelope, &verdict.task_id, &verdict.run_id)? {
            return Ok(o);
        }
        // Any verdict proves the auditor is alive.
        self.last_ping = Some(self.clock.now_ms());
        let has_evidence = self
            .status
            .run(&verdict.run_id)
            .is_some_and(|r| r.evidence_at.is_some());
        if !has_evidence {
            let expected = Some(verdict.run_id.clone());
            return self.ignore(envelope, &verdict.task_id, expected, &verdict.run_id, "verdict_before_evidence");
        }
        let outcome = self.record_verdict(verdict.clone(), envelope.actor, None)?;
        Ok(Outcome::from(&outcome))
    }

    fn record_verdict(
        &mut self,
        verdict: Verdict,
        actor: Actor,
        cause: Option<&EventId>,
    ) -> Result<AppendOutcome, OrchestratorError> {
        let mut event = self
            .event(EventType::WatchdogVerdict, actor)
            .task(&verdict.task_id)
            .run(&verdict.run_id);
        if let Some(c) = cause {
            event = event.caused_by(c);
        }
        let event = event.payload(&payload::VerdictRecorded { verdict: verdict.clone() })?;
        let outcome = self.append(event)?;
        if outcome.event().is_some() && verdict.verdict == VerdictKind::Warn {
            tracing::info!(
                project = %self.project,
                task_id = %verdict.task_id,
                run_id = %verdict.run_id,
                "verdict awaits human review"
            );
        }
        // A redelivered verdict still settles a run whose consequences were never written.
        let cause = outcome.event().map(|e| e.event_id.clone());
        self.settle(&verdict.run_id, None, cause.as_ref())?;
        Ok(outcome)
    }

    /// Write whatever the outcome on record for `run_id` still lacks: the halt a fatal BLOCK
    /// calls for, the `RUN_CLOSED`, then the requeue or review request. Every step has a
    /// derived key, so settling a run twice writes nothing new.
    ///
    /// `close_as` overrides the close reason implied by the outcome.
    fn settle(
        &mut self,
        run_id: &RunId,
        close_as: Option<CloseReason>,
        cause: Option<&EventId>,
    ) -> Result<(), OrchestratorError> {
        let Some(run) = self.status.run(run_id) else { return Ok(()) };
        let task_id = run.task_id.clone();
        if run.is_open() {
            let Some(close_reason) = close_as.or_else(|| run.implied_close_reason()) else {
                return Ok(());
            };
            if let Some(why) = self.halt_reason(run_id) {
                self.halt(&task_id, run_id, &why, cause)?;
            }
            self.close_run(&task_id, run_id, close_reason, cause)?;
        }
        if let Some(decision) = self.owed_follow_up(run_id) {
            self.follow_up(&task_id, run_id, decision)?;
        }
        Ok(())
    }

    /// The fatal reason of an auditor BLOCK recorded for `run_id`.
    fn halt_reason(&self, run_id: &RunId) -> Option<String> {
        let run = self.status.run(run_id)?;
        if run.human_verdict.is_some() {
            return None;
        }
        let task = self.status.task(&run.task_id)?;
        let verdict = task.verdict_for(run_id)?;
        match policy::decide_verdict(verdict, task.attempts, &self.config.policy) {
            VerdictDecision::Halt { reason } => Some(reason),
            _ => None,
        }
    }

    /// The requeue or review request a closed run is owed and does not have yet.
    ///
    /// Both follow-ups move the task out of BLOCKED, so a task still BLOCKED on this run
    /// after a retryable outcome has not been followed up.
    fn owed_follow_up(&self, run_id: &RunId) -> Option<RetryDecision> {
        let run = self.status.run(run_id)?;
        if run.is_open() {
            return None;
        }
        let task = self.status.task(&run.task_id)?;
        if task.state != TaskState::Blocked || task.current_run.is_some() || task.last_run() != Some(run_id) {
            return None;
        }
        match run.implied_close_reason()? {
            CloseReason::VerdictBlock if run.human_verdict.is_none() => {
                let verdict = task.verdict_for(run_id)?;
                match policy::decide_verdict(verdict, task.attempts, &self.config.policy) {
                    VerdictDecision::Block(decision) => Some(decision),
                    _ => None,
                }
            }
            CloseReason::WorkerFailed | CloseReason::WorkerTimeout | CloseReason::StaleAfterRestart => {
                Some(policy::decide_retry(task.attempts, &self.config.policy))
            }
            _ => None,
        }
    }

    fn halt(
        &mut self,
        task_id: &TaskId,
        run_id: &RunId,
        why: &str,
        cause: Option<&EventId>,
    ) -> Result<(), OrchestratorError> {
        tracing::error!(project = %self.project, task_id = %task_id, run_id = %run_id, reason = why, "halting project");
        let mut event = self
            .event(EventType::ProjectHalted, Actor::Orchestrator)
            .task(task_id)
            .run(run_id);
        if let Some(c) = cause {
            event = event.caused_by(c);
        }
        let event = event.payload(&payload::ProjectHalted { reason: why.to_string(), run_id: Some(run_id.clone()) })?;
        self.append(event)?;
        Ok(())
    }

    fn close_run(
        &mut self,
        task_id: &TaskId,
        run_id: &RunId,
        close_reason: CloseReason,
        cause: Option<&EventId>,
    ) -> Result<(), OrchestratorError> {
        let mut event = self
            .event(EventType::RunClosed, Actor::Orchestrator)
            .task(task_id)
            .run(run_id);
        if let Some(c) = cause {
            event = event.caused_by(c);
        }
        self.append(event.payload(&payload::RunClosed { close_reason })?)?;
        Ok(())
    }

    /// Requeue or escalate a task whose run closed without success.
    fn follow_up(&mut self, task_id: &TaskId, run_id: &RunId, decision: RetryDecision) -> Result<(), OrchestratorError> {
        let event = match decision {
            RetryDecision::Requeue => self
                .event(EventType::TaskRequeued, Actor::Orchestrator)
                .task(task_id)
                .run(run_id)
                .payload(&payload::TaskRequeued { reason: "auto_retry".to_string() })?,
            RetryDecision::Escalate => {
                tracing::warn!(project = %self.project, task_id = %task_id, "retries exhausted, requesting review");
                self.event(EventType::ReviewRequested, Actor::Orchestrator)
                    .task(task_id)
                    .run(run_id)
                    .payload(&payload::ReviewRequested { reason: "retries_exhausted".to_string() })?
            }
        };
        self.append(event)?;
        Ok(())
    }

    /// Record a run failure, then settle the run.
    fn fail_run(
        &mut self,
        task_id: &TaskId,
        run_id: &RunId,
        actor: Actor,
        why: &str,
        detail: Option<String>,
    ) -> Result<AppendOutcome, OrchestratorError> {
        tracing::warn!(project = %self.project, task_id = %task_id, run_id = %run_id, reason = why, "run failed");
        let event = self
            .event(EventType::WorkerRunFailed, actor)
            .task(task_id)
            .run(run_id)
            .payload(&payload::RunFailed { reason: why.to_string(), detail })?;
        let outcome = self.append(event)?;
        let cause = outcome.event().map(|e| e.event_id.clone());
        self.settle(run_id, None, cause.as_ref())?;
        Ok(outcome)
    }

    fn receive_failure(&mut self, envelope: &SignalEnvelope, failure: &RunFailure) -> Result<Outcome, OrchestratorError> {
        if let RunCheck::Ignored(o) = self.check_run(envelope, &failure.task_id, &failure.run_id)? {
            return Ok(o);
        }
        let outcome = self.fail_run(
            &failure.task_id,
            &failure.run_id,
            envelope.actor,
            &failure.reason,
            failure.detail.clone(),
        )?;
        Ok(Outcome::from(&outcome))
    }

    fn human(&mut self, envelope: &SignalEnvelope, command: &HumanCommand) -> Result<Outcome, OrchestratorError> {
        let key = match &envelope.idempotency_key {
            Some(k) => format!("{}:human:{k}", self.project),
            None => format!("{}:human:{}:after:{}", self.project, command.name(), self.status.last_sequence),
        };
        let actor = envelope.actor;
        let event = match command {
            HumanCommand::SelectSkill { task_id, skill } => {
                let task = self.require_task(task_id)?;
                if task.state.is_settled() && task.state != TaskState::Blocked {
                    return Err(ValidationError::NotApplicable(format!("task {task_id} is already finished")).into());
                }
                self.event(EventType::TaskSkillSet, actor)
                    .task(task_id)
                    .payload(&payload::SkillSet { skill: skill.clone() })?
            }
            HumanCommand::ApproveTier { task_id, tier, note } => {
                let task = self.require_task(task_id)?;
                if !task.gates.contains(&Gate::AwaitingPolicyApproval) {
                    return Err(ValidationError::NotApplicable(format!("task {task_id} has no pending tier request")).into());
                }
                self.event(EventType::PolicyTierApproved, actor)
                    .task(task_id)
                    .payload(&payload::TierApproved { tier: tier.clone(), note: note.clone() })?
            }
            HumanCommand::OverrideVerdict { task_id, run_id, verdict, note } => {
                if let RunCheck::Ignored(o) = self.check_run(envelope, task_id, run_id)? {
                    return Ok(o);
                }
                let event = self
                    .event(EventType::HumanVerdict, actor)
                    .task(task_id)
                    .run(run_id)
                    .payload(&payload::HumanVerdict { verdict: *verdict, note: note.clone() })?
                    .key(key);
                let outcome = self.append(event)?;
                let close_reason = match verdict {
                    VerdictKind::Pass => CloseReason::VerdictPass,
                    _ => CloseReason::VerdictBlock,
                };
                let cause = outcome.event().map(|e| e.event_id.clone());
                self.settle(run_id, Some(close_reason), cause.as_ref())?;
                return Ok(Outcome::from(&outcome));
            }
            HumanCommand::ResumeProject { note } => {
                if !self.status.is_halted() {
                    return Err(ValidationError::NotApplicable("project is not halted".into()).into());
                }
                self.event(EventType::ProjectResumed, actor)
                    .payload(&payload::HumanNote { note: note.clone() })?
            }
            HumanCommand::RestoreMode { note } => {
                if self.status.degraded_reason.is_none() {
                    return Err(ValidationError::NotApplicable("project is not degraded".into()).into());
                }
                self.event(EventType::ProjectModeRestored, actor)
                    .payload(&payload::HumanNote { note: note.clone() })?
            }
            HumanCommand::RetryTask { task_id, .. } => {
                let task = self.require_task(task_id)?;
                if !task.state.is_requeueable() || self.status.open_run(task_id).is_some() {
                    return Err(ValidationError::NotApplicable(format!(
                        "task {task_id} cannot be retried from {:?}",
                        task.state
                    ))
                    .into());
                }
                self.event(EventType::TaskRequeued, actor)
                    .task(task_id)
                    .payload(&payload::TaskRequeued { reason: "human_retry".to_string() })?
            }
            HumanCommand::AbortRun { task_id, run_id, note } => {
                if let RunCheck::Ignored(o) = self.check_run(envelope, task_id, run_id)? {
                    return Ok(o);
                }
                let event = self
                    .event(EventType::WorkerRunAborted, actor)
                    .task(task_id)
                    .run(run_id)
                    .payload(&payload::RunAborted { note: note.clone() })?
                    .key(key);
                let outcome = self.append(event)?;
                let cause = outcome.event().map(|e| e.event_id.clone());
                self.settle(run_id, Some(CloseReason::Aborted), cause.as_ref())?;
                return Ok(Outcome::from(&outcome));
            }
        };
        let outcome = self.append(event.key(key))?;
        Ok(Outcome::from(&outcome))
    }

    fn ping(&mut self) -> Result<Outcome, OrchestratorError> {
        let now = self.clock.now_ms();
        self.last_ping = Some(now);
        let persist_every = self.config.timers.heartbeat_persist();
        let due = self.status.watchdog == WatchdogHealth::Unresponsive
            || self.status.last_heartbeat_at.map_or(true, |at| now - at >= persist_every);
        if !due {
            return Ok(Outcome::Coalesced);
        }
        let event = self
            .event(EventType::WatchdogHeartbeat, Actor::Auditor)
            .key(format!("{}:WATCHDOG_HEARTBEAT:{now}", self.project));
        let outcome = self.append(event)?;
        Ok(Outcome::from(&outcome))
    }

    fn dispatch(&mut self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        let Some(task) = self.status.task(task_id) else { return Ok(()) };
        if !self.status.is_dispatchable(task) {
            return Ok(());
        }
        let run_id = RunId::generate();
        let attempt = task.attempts + 1;
        let intent = self
            .event(EventType::WorkerRunIntent, Actor::Orchestrator)
            .task(task_id)
            .run(&run_id)
            .payload(&payload::RunIntent { attempt })?;
        let outcome = self.append(intent)?;
        let cause = outcome.event().map(|e| e.event_id.clone());

        let Some(task) = self.status.task(task_id) else { return Ok(()) };
        let request = DispatchRequest {
            project: &self.project,
            run_id: &run_id,
            attempt,
            spec: &task.spec,
            skill: task.skill.as_deref(),
            policy_tier: task.policy_tier.as_deref(),
        };
        let dispatched = self.dispatcher.dispatch(&request);
        match dispatched {
            Ok(receipt) => {
                let mut event = self
                    .event(EventType::WorkerRunStarted, Actor::Orchestrator)
                    .task(task_id)
                    .run(&run_id);
                if let Some(c) = &cause {
                    event = event.caused_by(c);
                }
                self.append(event.payload(&payload::RunStarted { receipt })?)?;
            }
            Err(e) => {
                self.fail_run(
                    task_id,
                    &run_id,
                    Actor::Orchestrator,
                    reason::DISPATCH_FAILED,
                    Some(format!("{e:#}")),
                )?;
            }
        }
        Ok(())
    }

    fn record_corruption(&mut self, corrupted: &[CorruptedEntry]) -> Result<(), OrchestratorError> {
        if corrupted.is_empty() {
            return Ok(());
        }
        for entry in corrupted {
            tracing::warn!(
                project = %self.project,
                sequence = entry.sequence,
                reason = %entry.reason,
                "corrupted log entry skipped"
            );
            let event = self
                .event(EventType::CorruptedEntryDetected, Actor::Orchestrator)
                .payload(&payload::CorruptedEntryDetected {
                    sequence: entry.sequence,
                    reason: entry.reason.clone(),
                    content_hash: entry.content_hash.clone(),
                })?
                .key(format!("{}:CORRUPTED_ENTRY_DETECTED:{}", self.project, entry.sequence));
            self.append(event)?;
        }
        let sequences: Vec<String> = corrupted.iter().map(|c| c.sequence.to_string()).collect();
        let event = self
            .event(EventType::RecoveryStarted, Actor::Orchestrator)
            .payload(&payload::RecoveryStarted { corrupted_entries: corrupted.len() })?
            .key(format!("{}:RECOVERY_STARTED:{}", self.project, sequences.join(",")));
        self.append(event)?;
        Ok(())
    }

    /// Close runs whose outcome is on record but whose `RUN_CLOSED` never made it to the log,
    /// and remember the rest for the restart stale-check.
    fn reconcile(&mut self) -> Result<(), OrchestratorError> {
        let open: Vec<(TaskId, RunId, Option<CloseReason>)> = self
            .status
            .open_runs()
            .map(|r| (r.task_id.clone(), r.run_id.clone(), r.implied_close_reason()))
            .collect();
        let mut unresolved = BTreeSet::new();
        for (task_id, run_id, implied) in open {
            let Some(implied) = implied else {
                unresolved.insert(run_id);
                continue;
            };
            tracing::info!(
                project = %self.project,
                task_id = %task_id,
                run_id = %run_id,
                outcome = reducer::close_reason_code(implied),
                "closing run left open across restart"
            );
            self.settle(&run_id, Some(CloseReason::RecoveredClose), None)?;
        }
        if !unresolved.is_empty() {
            tracing::info!(project = %self.project, runs = unresolved.len(), "watching runs open across restart");
            self.restart_watch = Some(RestartWatch { began_at: self.started_at, runs: unresolved });
        }
        Ok(())
    }

    /// Repair what a failed write left behind: screen evidence that was never screened,
    /// and settle runs with an outcome on record that are still open or still owe a
    /// follow-up.
    fn settle_outstanding(&mut self) -> Result<(), OrchestratorError> {
        let unscreened: Vec<RunId> = self
            .status
            .open_runs()
            .filter(|r| r.evidence_at.is_some() && r.verdict.is_none() && !r.terminal_conditions_met())
            .map(|r| r.run_id.clone())
            .collect();
        for run_id in &unscreened {
            self.screen(run_id, None)?;
        }
        let unsettled: Vec<(TaskId, RunId)> = self
            .status
            .runs
            .values()
            .filter(|r| {
                if r.is_open() {
                    r.implied_close_reason().is_some()
                } else {
                    self.owed_follow_up(&r.run_id).is_some()
                }
            })
            .map(|r| (r.task_id.clone(), r.run_id.clone()))
            .collect();
        for (task_id, run_id) in unsettled {
            tracing::warn!(project = %self.project, task_id = %task_id, run_id = %run_id, "settling unfinished run");
            self.settle(&run_id, None, None)?;
        }
        Ok(())
    }

    /// Hand every newly finished task to the notifier once per run.
    fn report_results(&mut self) -> Result<(), OrchestratorError> {
        let finished: Vec<TaskResult> = self
            .status
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Done | TaskState::Blocked) && t.current_run.is_none())
            .filter_map(|t| {
                let run_id = t.last_run()?;
                let run = self.status.run(run_id)?;
                let unreported = !run.is_open()
                    && t.notified_run.as_ref() != Some(run_id)
                    && self.owed_follow_up(run_id).is_none();
                unreported.then(|| TaskResult {
                    project: self.project.clone(),
                    task_id: t.id().clone(),
                    run_id: run_id.clone(),
                    state: t.state,
                    verdict: run.human_verdict.or(run.verdict),
                    failure_reason: t.failure_reason.clone(),
                })
            })
            .collect();
        for result in finished {
            if let Err(e) = self.notifier.notify(&result) {
                tracing::warn!(
                    project = %self.project,
                    task_id = %result.task_id,
                    run_id = %result.run_id,
                    error = %format!("{e:#}"),
                    "result notification failed"
                );
                continue;
            }
            let event = self
                .event(EventType::ResultNotified, Actor::Orchestrator)
                .task(&result.task_id)
                .run(&result.run_id)
                .payload(&payload::ResultNotified {
                    state: result.state,
                    verdict: result.verdict,
                    failure_reason: result.failure_reason.clone(),
                    message: result.message(),
                })?
                .key(format!("{}:{}:{}:notified", self.project, result.task_id, result.run_id));
            self.append(event)?;
        }
        Ok(())
    }

    fn finish_if_complete(&mut self) -> Result<(), OrchestratorError> {
        if self.status.phase != Phase::Running || self.status.is_halted() || !self.status.all_tasks_done() {
            return Ok(());
        }
        let tasks = self.status.tasks.len();
        tracing::info!(project = %self.project, tasks, "every task done");
        let event = self
            .event(EventType::ProjectFinished, Actor::Orchestrator)
            .payload(&payload::ProjectFinished { tasks })?
            .key(format!("{}:PROJECT_FINISHED:{tasks}", self.project));
        self.append(event)?;
        Ok(())
    }

    fn watch_heartbeat(&mut self, now: EpochMs) -> Result<(), OrchestratorError> {
        if self.status.is_halted()
            || self.status.phase == Phase::Finished
            || self.status.watchdog == WatchdogHealth::Unresponsive
        {
            return Ok(());
        }
        let baseline = [
            Some(self.started_at),
            self.last_ping,
            self.status.last_heartbeat_at,
            self.status.mode_restored_at,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.started_at);
        let silent_ms = now - baseline;
        if silent_ms <= self.config.timers.heartbeat_timeout() {
            return Ok(());
        }
        tracing::warn!(project = %self.project, silent_ms, "auditor heartbeat missing");
        let event = self
            .event(EventType::WatchdogUnresponsive, Actor::Orchestrator)
            .payload(&payload::WatchdogUnresponsive { silent_since: baseline, silent_ms })?
            .key(format!("{}:WATCHDOG_UNRESPONSIVE:{baseline}", self.project));
        self.append(event)?;
        Ok(())
    }

    fn watch_verdicts(&mut self, now: EpochMs) -> Result<(), OrchestratorError> {
        let timeout = self.config.timers.verdict_timeout();
        let due: Vec<(TaskId, RunId, EpochMs)> = self
            .status
            .open_runs()
            .filter(|r| r.verdict.is_none() && r.verdict_timed_out_at.is_none() && !r.terminal_conditions_met())
            .filter_map(|r| {
                let at = r.evidence_at?;
                (now - at >= timeout).then(|| (r.task_id.clone(), r.run_id.clone(), at))
            })
            .collect();
        for (task_id, run_id, evidence_at) in due {
            tracing::warn!(project = %self.project, task_id = %task_id, run_id = %run_id, "verdict overdue");
            let event = self
                .event(EventType::VerdictTimeout, Actor::Orchestrator)
                .task(&task_id)
                .run(&run_id)
                .payload(&payload::VerdictTimeout { evidence_at, waited_ms: now - evidence_at })?;
            self.append(event)?;
        }
        Ok(())
    }

    fn watch_workers(&mut self, now: EpochMs) -> Result<(), OrchestratorError> {
        let timeout = self.config.timers.worker_timeout();
        let watched = self.restart_watch.as_ref().map(|w| &w.runs);
        let due: Vec<(TaskId, RunId)> = self
            .status
            .open_runs()
            .filter(|r| r.evidence_at.is_none() && !r.terminal_conditions_met())
            .filter(|r| now - r.started_at >= timeout)
            .filter(|r| !watched.is_some_and(|w| w.contains(&r.run_id)))
            .map(|r| (r.task_id.clone(), r.run_id.clone()))
            .collect();
        for (task_id, run_id) in due {
            self.fail_run(
                &task_id,
                &run_id,
                Actor::Orchestrator,
                reason::WORKER_TIMEOUT,
                None,
            )?;
        }
        Ok(())
    }

    fn watch_restart(&mut self, now: EpochMs) -> Result<(), OrchestratorError> {
        let due = self
            .restart_watch
            .as_ref()
            .is_some_and(|w| now - w.began_at > self.config.timers.stale_after_restart());
        if !due {
            return Ok(());
        }
        let Some(watch) = self.restart_watch.take() else { return Ok(()) };
        for run_id in watch.runs {
            let Some(run) = self.status.run(&run_id) else { continue };
            if !run.is_open() {
                continue;
            }
            let task_id = run.task_id.clone();
            let in_review = self
                .status
                .task(&task_id)
                .is_some_and(|t| t.state == TaskState::NeedsHumanReview);
            if in_review {
                continue;
            }
            self.fail_run(
                &task_id,
                &run_id,
                Actor::Orchestrator,
                reason::STALE_AFTER_RESTART,
                None,
            )?;
        }
        Ok(())
    }

    fn expire_reviews(&mut self, now: EpochMs) -> Result<(), OrchestratorError> {
        let Some(expiry) = self.config.timers.review_expiry() else { return Ok(()) };
        let due: Vec<(TaskId, RunId)> = self
            .status
            .open_runs()
            .filter(|r| r.review_since.is_some_and(|since| now - since >= expiry))
            .filter(|r| {
                self.status
                    .task(&r.task_id)
                    .is_some_and(|t| t.state == TaskState::NeedsHumanReview)
            })
            .map(|r| (r.task_id.clone(), r.run_id.clone()))
            .collect();
        for (task_id, run_id) in due {
            tracing::warn!(project = %self.project, task_id = %task_id, run_id = %run_id, "human review expired");
            self.close_run(&task_id, &run_id, CloseReason::VerdictTimeout, None)?;
        }
        Ok(())
    }
}
