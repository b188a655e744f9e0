//! Fold from the ordered event sequence to a [`ProjectStatus`].
//!
//! The reducer records facts. It never decides anything: closing runs, halting and
//! dispatching are all separate events written by the control loop.

use crate::payload;
use crate::{
    Alert, AlertKind, CloseReason, DegradedReason, Event, EventType, Mode, Phase, ProjectId,
    ProjectStatus, Risk, RunRecord, RunState, TaskRecord, TaskState, VerdictKind, WatchdogHealth,
};

/// Rebuild status from scratch.
pub fn reduce(project: &ProjectId, events: &[Event]) -> ProjectStatus {
    let mut status = ProjectStatus::empty(project.clone());
    for event in events {
        apply(&mut status, event);
    }
    status
}

/// Apply one event. Events from another project, or at or below `last_sequence`, are skipped,
/// so applying an already folded event is a no-op.
pub fn apply(status: &mut ProjectStatus, event: &Event) {
    if event.project != status.project || event.sequence <= status.last_sequence {
        return;
    }
    status.last_sequence = event.sequence;

    match &event.event_type {
        EventType::ProjectStarted => status.phase = Phase::Running,
        EventType::ProjectHalted => on_project_halted(status, event),
        EventType::ProjectResumed => on_project_resumed(status, event),
        EventType::ProjectModeRestored => {
            status.degraded_reason = None;
            status.watchdog = WatchdogHealth::Healthy;
            status.mode_restored_at = Some(event.timestamp);
            status.alerts.retain(|a| {
                !matches!(
                    a.kind,
                    AlertKind::WatchdogUnresponsive
                        | AlertKind::MultipleOpenRuns
                        | AlertKind::CorruptedEntry
                )
            });
        }
        EventType::WatchdogHeartbeat => {
            status.last_heartbeat_at = Some(event.timestamp);
            status.watchdog = WatchdogHealth::Healthy;
        }
        EventType::WatchdogUnresponsive => {
            status.watchdog = WatchdogHealth::Unresponsive;
            status.degraded_reason = Some(DegradedReason::WatchdogUnresponsive);
            raise(status, event, AlertKind::WatchdogUnresponsive, "auditor heartbeat missing");
        }
        EventType::TaskspecPublished => on_task_published(status, event),
        EventType::TaskSkillSet => {
            if let (Some(task), Some(p)) = (task_mut(status, event), event.payload_as::<payload::SkillSet>()) {
                task.skill = Some(p.skill);
                task.gates.remove(&crate::Gate::AwaitingSkillDecision);
                task.updated_at = event.timestamp;
            }
        }
        EventType::PolicyTierRequested => {
            if let Some(task) = task_mut(status, event) {
                task.gates.insert(crate::Gate::AwaitingPolicyApproval);
                task.updated_at = event.timestamp;
            }
        }
        EventType::PolicyTierApproved => {
            if let (Some(task), Some(p)) = (task_mut(status, event), event.payload_as::<payload::TierApproved>()) {
                task.policy_tier = Some(p.tier);
                task.gates.remove(&crate::Gate::AwaitingPolicyApproval);
                task.updated_at = event.timestamp;
            }
        }
        EventType::WorkerRunIntent => on_run_intent(status, event),
        EventType::WorkerRunStarted => {
            if let Some(run) = live_run_mut(status, event) {
                run.acknowledged_at = Some(event.timestamp);
            }
        }
        EventType::EvidenceSubmitted => {
            let Some(run) = live_run_mut(status, event) else { return };
            run.evidence_at = Some(event.timestamp);
            let evidence = event.payload_as::<payload::EvidenceSubmitted>().map(|p| p.evidence);
            if let Some(task) = task_mut(status, event) {
                task.state = TaskState::AwaitingVerdict;
                task.last_evidence = evidence;
                task.updated_at = event.timestamp;
            }
        }
        EventType::WatchdogVerdict => on_verdict(status, event),
        EventType::HumanVerdict => on_human_verdict(status, event),
        EventType::VerdictTimeout => {
            let Some(run) = live_run_mut(status, event) else { return };
            run.verdict_timed_out_at = Some(event.timestamp);
            run.review_since.get_or_insert(event.timestamp);
            set_task_state(status, event, TaskState::NeedsHumanReview);
            raise(status, event, AlertKind::VerdictTimeout, "no verdict before deadline");
        }
        EventType::ReviewRequested => {
            if let Some(run) = live_run_mut(status, event) {
                run.review_since.get_or_insert(event.timestamp);
            }
            set_task_state(status, event, TaskState::NeedsHumanReview);
        }
        EventType::WorkerRunFailed => {
            let Some(run) = live_run_mut(status, event) else { return };
            let reason = event
                .payload_as::<payload::RunFailed>()
                .map(|p| p.reason)
                .unwrap_or_else(|| "unknown".to_string());
            run.failure = Some(reason.clone());
            if let Some(task) = task_mut(status, event) {
                task.state = TaskState::Blocked;
                task.failure_reason = Some(reason);
                task.updated_at = event.timestamp;
            }
        }
        EventType::WorkerRunAborted => {
            let Some(run) = live_run_mut(status, event) else { return };
            run.aborted = true;
            set_task_state(status, event, TaskState::Canceled);
        }
        EventType::RunClosed => on_run_closed(status, event),
        EventType::TaskRequeued => {
            let has_open = event
                .task_id
                .as_ref()
                .map(|t| status.open_runs_for(t) > 0)
                .unwrap_or(true);
            if let Some(task) = task_mut(status, event) {
                if task.state.is_requeueable() && !has_open {
                    task.state = TaskState::Pending;
                    task.failure_reason = None;
                    task.updated_at = event.timestamp;
                }
            }
        }
        EventType::MessageIgnored => {
            if let Some(p) = event.payload_as::<payload::MessageIgnored>() {
                status.risks.push(Risk {
                    message_type: p.message_type,
                    task_id: event.task_id.clone(),
                    reason: p.reason,
                    sequence: event.sequence,
                });
            }
        }
        EventType::CorruptedEntryDetected => {
            raise(status, event, AlertKind::CorruptedEntry, "corrupted log entry skipped");
        }
        EventType::RecoveryStarted => {
            status.degraded_reason = Some(DegradedReason::Recovery);
        }
        EventType::ProjectFinished => status.phase = Phase::Finished,
        EventType::ResultNotified => {
            if let Some(task) = task_mut(status, event) {
                task.notified_run = event.run_id.clone();
            }
        }
        EventType::Other(_) => {}
    }

    refresh_derived(status);
}

fn on_project_halted(status: &mut ProjectStatus, event: &Event) {
    let reason = event
        .payload_as::<payload::ProjectHalted>()
        .map(|p| p.reason)
        .unwrap_or_else(|| "unspecified".to_string());
    status.halt_reason = Some(reason.clone());
    raise(status, event, AlertKind::ProjectHalted, &reason);
}

fn on_project_resumed(status: &mut ProjectStatus, event: &Event) {
    status.halt_reason = None;
    status.alerts.retain(|a| a.kind != AlertKind::ProjectHalted);
    let open: Vec<_> = status.open_runs().map(|r| r.task_id.clone()).collect();
    for task in status.tasks.values_mut() {
        if task.state.is_requeueable() && !open.contains(&task.spec.task_id) {
            task.state = TaskState::Pending;
            task.failure_reason = None;
            task.updated_at = event.timestamp;
        }
    }
}

fn on_task_published(status: &mut ProjectStatus, event: &Event) {
    let Some(p) = event.payload_as::<payload::TaskPublished>() else { return };
    if status.tasks.contains_key(&p.spec.task_id) {
        return;
    }
    if status.phase == Phase::Finished {
        status.phase = Phase::Running;
    }
    let record = TaskRecord {
        state: TaskState::Pending,
        gates: p.gates.into_iter().collect(),
        current_run: None,
        runs: Vec::new(),
        attempts: 0,
        skill: p.spec.preferred_skill.clone(),
        policy_tier: None,
        last_evidence: None,
        last_verdict: None,
        failure_reason: None,
        notified_run: None,
        updated_at: event.timestamp,
        spec: p.spec,
    };
    status.tasks.insert(record.spec.task_id.clone(), record);
}

fn on_run_intent(status: &mut ProjectStatus, event: &Event) {
    let (Some(task_id), Some(run_id)) = (&event.task_id, &event.run_id) else { return };
    if !status.tasks.contains_key(task_id) || status.runs.contains_key(run_id) {
        return;
    }
    if status.open_runs_for(task_id) > 0 {
        status.degraded_reason = Some(DegradedReason::MultipleOpenRuns);
        raise(status, event, AlertKind::MultipleOpenRuns, "second open run for task");
    }
    let Some(task) = status.tasks.get_mut(task_id) else { return };
    task.attempts += 1;
    task.state = TaskState::Dispatched;
    task.current_run = Some(run_id.clone());
    task.runs.push(run_id.clone());
    task.updated_at = event.timestamp;
    let attempt = task.attempts;
    status.runs.insert(
        run_id.clone(),
        RunRecord {
            run_id: run_id.clone(),
            task_id: task_id.clone(),
            state: RunState::Open,
            attempt,
            started_at: event.timestamp,
            acknowledged_at: None,
            evidence_at: None,
            verdict: None,
            human_verdict: None,
            verdict_timed_out_at: None,
            review_since: None,
            failure: None,
            aborted: false,
            closed_at: None,
        },
    );
}

fn on_verdict(status: &mut ProjectStatus, event: &Event) {
    let Some(p) = event.payload_as::<payload::VerdictRecorded>() else { return };
    let kind = p.verdict.verdict;
    let Some(run) = live_run_mut(status, event) else { return };
    run.verdict = Some(kind);
    if kind == VerdictKind::Warn {
        run.review_since.get_or_insert(event.timestamp);
    }
    if let Some(task) = task_mut(status, event) {
        task.state = match kind {
            VerdictKind::Pass => TaskState::Done,
            VerdictKind::Warn => TaskState::NeedsHumanReview,
            VerdictKind::Block => TaskState::Blocked,
        };
        task.last_verdict = Some(p.verdict);
        task.updated_at = event.timestamp;
    }
}

fn on_human_verdict(status: &mut ProjectStatus, event: &Event) {
    let Some(p) = event.payload_as::<payload::HumanVerdict>() else { return };
    let Some(run) = live_run_mut(status, event) else { return };
    run.human_verdict = Some(p.verdict);
    let next = match p.verdict {
        VerdictKind::Pass => TaskState::Done,
        VerdictKind::Block => TaskState::Blocked,
        VerdictKind::Warn => TaskState::NeedsHumanReview,
    };
    set_task_state(status, event, next);
    if let Some(run_id) = &event.run_id {
        status
            .alerts
            .retain(|a| !(a.kind == AlertKind::VerdictTimeout && a.run_id.as_ref() == Some(run_id)));
    }
}

fn on_run_closed(status: &mut ProjectStatus, event: &Event) {
    let Some(p) = event.payload_as::<payload::RunClosed>() else { return };
    let Some(run_id) = &event.run_id else { return };
    let Some(run) = status.runs.get_mut(run_id) else { return };
    if !run.is_open() {
        return;
    }
    run.state = RunState::Closed { reason: p.close_reason };
    run.closed_at = Some(event.timestamp);
    let task_id = run.task_id.clone();

    status
        .alerts
        .retain(|a| !(a.kind == AlertKind::VerdictTimeout && a.run_id.as_ref() == Some(run_id)));

    if let Some(task) = status.tasks.get_mut(&task_id) {
        if task.current_run.as_ref() == Some(run_id) {
            task.current_run = None;
        }
        // A run that ends without a recorded outcome leaves its task blocked.
        if matches!(
            task.state,
            TaskState::Dispatched | TaskState::AwaitingVerdict | TaskState::NeedsHumanReview
        ) && p.close_reason != CloseReason::RecoveredClose
        {
            task.state = TaskState::Blocked;
            if task.failure_reason.is_none() {
                task.failure_reason = Some(close_reason_code(p.close_reason).to_string());
            }
        }
        task.updated_at = event.timestamp;
    }
}

pub fn close_reason_code(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::VerdictPass => "verdict_pass",
        CloseReason::VerdictBlock => "verdict_block",
        CloseReason::VerdictTimeout => "verdict_timeout",
        CloseReason::StaleAfterRestart => "stale_after_restart",
        CloseReason::Aborted => "aborted",
        CloseReason::RecoveredClose => "recovered_close",
        CloseReason::WorkerFailed => "worker_failed",
        CloseReason::WorkerTimeout => "worker_timeout",
    }
}

fn task_mut<'a>(status: &'a mut ProjectStatus, event: &Event) -> Option<&'a mut TaskRecord> {
    status.tasks.get_mut(event.task_id.as_ref()?)
}

fn set_task_state(status: &mut ProjectStatus, event: &Event, state: TaskState) {
    if let Some(task) = task_mut(status, event) {
        task.state = state;
        task.updated_at = event.timestamp;
    }
}

/// The event's run, only if it is the open run of the event's task.
fn live_run_mut<'a>(status: &'a mut ProjectStatus, event: &Event) -> Option<&'a mut RunRecord> {
    let task = status.tasks.get(event.task_id.as_ref()?)?;
    let run_id = event.run_id.as_ref()?;
    if task.current_run.as_ref() != Some(run_id) {
        return None;
    }
    status.runs.get_mut(run_id).filter(|r| r.is_open())
}

fn raise(status: &mut ProjectStatus, event: &Event, kind: AlertKind, message: &str) {
    status.alerts.push(Alert {
        kind,
        task_id: event.task_id.clone(),
        run_id: event.run_id.clone(),
        message: message.to_string(),
        sequence: event.sequence,
    });
}

fn refresh_derived(status: &mut ProjectStatus) {
    status.mode = if status.halt_reason.is_some() {
        Mode::Halted
    } else if status.degraded_reason.is_some() {
        Mode::Degraded
    } else {
        Mode::Normal
    };

    let mut progress = crate::Progress::default();
    for task in status.tasks.values() {
        progress.total += 1;
        match task.state {
            TaskState::Done => progress.done += 1,
            TaskState::Blocked | TaskState::Canceled => progress.blocked += 1,
            TaskState::NeedsHumanReview => progress.needs_review += 1,
            TaskState::Dispatched | TaskState::AwaitingVerdict => progress.in_flight += 1,
            TaskState::Pending => {}
        }
    }
    status.progress = progress;
}
