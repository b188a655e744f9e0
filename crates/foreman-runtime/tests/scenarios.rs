mod common;

use common::*;
use foreman_core::payload::{RunFailed, VerdictRecorded};
use foreman_core::{
    Actor, AlertKind, CloseReason, DegradedReason, EventType, Gate, HumanCommand, Mode, NewEvent, Phase,
    RiskLevel, RunFailure, RunState, Signal, SignalEnvelope, TaskId, TaskState, ValidationError, VerdictKind,
};
use foreman_log::EventLog;
use foreman_runtime::{OrchestratorConfig, OrchestratorError, Outcome};

fn t(id: &str) -> TaskId {
    TaskId::from(id)
}

#[test]
fn happy_path_ends_done_with_run_closed_as_passed() {
    let mut h = Harness::new();
    assert!(matches!(h.publish("T1", &[]), Outcome::Appended { .. }));

    let r1 = h.open_run("T1");
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Dispatched);
    assert_eq!(h.dispatcher.runs().len(), 1);
    assert_eq!(h.dispatcher.runs()[0].run_id, r1);

    h.evidence("T1", &r1);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::AwaitingVerdict);

    h.verdict("T1", &r1, VerdictKind::Pass, &[]);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Done);
    assert_eq!(h.run_state(&r1), RunState::Closed { reason: CloseReason::VerdictPass });
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictPass]);
    assert_eq!(h.orch.status().progress.done, 1);
    assert_eq!(&h.orch.rebuild_status().unwrap(), h.orch.status());
}

#[test]
fn silent_auditor_degrades_once_until_restored() {
    let mut h = Harness::new();
    h.clock.advance_minutes(4);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 1);
    assert_eq!(h.orch.status().mode, Mode::Degraded);
    assert_eq!(h.orch.status().degraded_reason, Some(DegradedReason::WatchdogUnresponsive));

    h.clock.advance_minutes(4);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 1);

    // A ping while unresponsive is persisted immediately, but the mode needs a human.
    assert!(matches!(h.ping(), Outcome::Appended { .. }));
    assert_eq!(h.orch.status().mode, Mode::Degraded);
    h.human(HumanCommand::RestoreMode { note: Some("auditor back".into()) });
    assert_eq!(h.orch.status().mode, Mode::Normal);

    h.clock.advance_minutes(2);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 1);
    h.clock.advance_minutes(2);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 2);
}

#[test]
fn pings_are_coalesced_between_persisted_heartbeats() {
    let mut h = Harness::new();
    assert!(matches!(h.ping(), Outcome::Appended { .. }));
    h.clock.advance(10_000);
    assert_eq!(h.ping(), Outcome::Coalesced);
    h.clock.advance(50_000);
    assert!(matches!(h.ping(), Outcome::Appended { .. }));
    assert_eq!(h.count(EventType::WatchdogHeartbeat), 2);

    // In-memory pings still count as liveness.
    h.clock.advance(30_000);
    assert_eq!(h.ping(), Outcome::Coalesced);
    h.clock.advance(170_000);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 0);
}

#[test]
fn missing_verdict_times_out_into_review_with_run_open() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);

    h.advance_minutes_with_pings(4);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::VerdictTimeout), 0);

    h.advance_minutes_with_pings(2);
    h.orch.tick().unwrap();
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::VerdictTimeout), 1);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::NeedsHumanReview);
    assert!(h.run_state(&r1).is_open());
    assert!(h.orch.status().has_alert(AlertKind::VerdictTimeout));
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 0);
}

#[test]
fn restart_closes_a_run_whose_verdict_was_already_logged() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r2 = h.open_run("T1");
    h.evidence("T1", &r2);

    // The verdict made it to the log but the loop died before closing the run.
    let verdict = NewEvent::new(&project(), EventType::WatchdogVerdict, Actor::Auditor, T0)
        .task(&t("T1"))
        .run(&r2)
        .payload(&VerdictRecorded { verdict: verdict("T1", &r2, VerdictKind::Pass, &[]) })
        .unwrap()
        .derive_key();
    h.log.append(verdict).unwrap();

    h.restart();
    assert_eq!(h.closes(&r2), vec![CloseReason::RecoveredClose]);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Done);

    h.restart();
    assert_eq!(h.closes(&r2), vec![CloseReason::RecoveredClose]);
    assert_eq!(h.count(EventType::ProjectStarted), 1);
}

#[test]
fn restart_restores_the_halt_a_crash_interrupted() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);

    let verdict = NewEvent::new(&project(), EventType::WatchdogVerdict, Actor::Auditor, T0)
        .task(&t("T1"))
        .run(&r1)
        .payload(&VerdictRecorded { verdict: verdict("T1", &r1, VerdictKind::Block, &["deny_command_used"]) })
        .unwrap()
        .derive_key();
    h.log.append(verdict).unwrap();

    h.restart();
    assert_eq!(h.closes(&r1), vec![CloseReason::RecoveredClose]);
    assert_eq!(h.orch.status().mode, Mode::Halted);
    assert_eq!(h.count(EventType::ProjectHalted), 1);
}

#[test]
fn signal_for_a_stale_run_is_ignored() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r_old = h.open_run("T1");
    h.submit(
        Actor::Worker,
        Signal::RunFailed(RunFailure {
            task_id: t("T1"),
            run_id: r_old.clone(),
            reason: "worker crashed".into(),
            detail: None,
        }),
    );
    let r_new = h.open_run("T1");
    assert_ne!(r_old, r_new);

    let before = h.orch.status().clone();
    let first = h.verdict("T1", &r_old, VerdictKind::Pass, &[]);
    assert!(matches!(first, Outcome::Ignored { .. }));
    let after = h.orch.status();
    assert_eq!(after.tasks, before.tasks);
    assert_eq!(after.runs, before.runs);
    assert_eq!(after.risks.len(), 1);
    assert_eq!(after.risks[0].reason, "run_mismatch");

    // Redelivery of the same message is not recorded twice.
    let again = h.verdict("T1", &r_old, VerdictKind::Pass, &[]);
    assert_eq!(again, first);
    assert_eq!(h.count(EventType::MessageIgnored), 1);
}

#[test]
fn verdict_before_evidence_is_ignored() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    assert!(matches!(h.verdict("T1", &r1, VerdictKind::Pass, &[]), Outcome::Ignored { .. }));
    assert_eq!(h.orch.status().risks[0].reason, "verdict_before_evidence");
    assert!(h.run_state(&r1).is_open());
}

#[test]
fn fatal_block_halts_until_resumed() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Block, &["tests_failed", "deny_command_used"]);

    let status = h.orch.status();
    assert_eq!(status.mode, Mode::Halted);
    assert_eq!(status.halt_reason.as_deref(), Some("deny_command_used"));
    assert_eq!(status.task(&t("T1")).unwrap().state, TaskState::Blocked);
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictBlock]);

    let events = h.events();
    let verdict = events.iter().find(|e| e.event_type == EventType::WatchdogVerdict).unwrap();
    let halted = events.iter().find(|e| e.event_type == EventType::ProjectHalted).unwrap();
    assert_eq!(halted.causation_id.as_ref(), Some(&verdict.event_id));
    assert!(halted.sequence < events.iter().rev().find(|e| e.event_type == EventType::RunClosed).unwrap().sequence);

    h.publish("T2", &[]);
    h.orch.tick().unwrap();
    assert!(h.orch.status().open_run(&t("T2")).is_none());

    h.human(HumanCommand::ResumeProject { note: None });
    let status = h.orch.status();
    assert_eq!(status.mode, Mode::Normal);
    assert!(status.open_run(&t("T1")).is_some());
    assert!(status.open_run(&t("T2")).is_some());
}

#[test]
fn non_fatal_block_requeues_until_attempts_run_out() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    for attempt in 1..=3 {
        let run = h.open_run("T1");
        assert_eq!(h.orch.status().run(&run).unwrap().attempt, attempt);
        h.evidence("T1", &run);
        h.verdict("T1", &run, VerdictKind::Block, &["tests_failed"]);
        assert_eq!(h.closes(&run), vec![CloseReason::VerdictBlock]);
    }
    let status = h.orch.status();
    assert_eq!(status.task(&t("T1")).unwrap().state, TaskState::NeedsHumanReview);
    assert!(status.open_run(&t("T1")).is_none());
    assert_eq!(status.mode, Mode::Normal);
    assert_eq!(h.count(EventType::TaskRequeued), 2);
    assert_eq!(h.count(EventType::ReviewRequested), 1);

    h.human(HumanCommand::RetryTask { task_id: t("T1"), note: None });
    assert_eq!(h.orch.status().open_run(&t("T1")).unwrap().attempt, 4);
}

#[test]
fn evidence_escaping_the_repo_halts_the_project() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.submit(
        Actor::Worker,
        Signal::Evidence(evidence_touching("T1", &r1, &["../../etc/passwd"], &["cargo test"])),
    );

    let status = h.orch.status();
    assert_eq!(status.mode, Mode::Halted);
    assert_eq!(status.halt_reason.as_deref(), Some("path_outside_project"));
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictBlock]);
    let verdict = h.events().into_iter().find(|e| e.event_type == EventType::WatchdogVerdict).unwrap();
    assert_eq!(verdict.actor, Actor::Orchestrator);
}

#[test]
fn deny_path_touch_blocks_without_halting() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.submit(Actor::Worker, Signal::Evidence(evidence_touching("T1", &r1, &[".git/config"], &["git commit"])));

    assert_eq!(h.orch.status().mode, Mode::Normal);
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictBlock]);
    assert_ne!(h.open_run("T1"), r1);
}

#[test]
fn runs_open_across_restart_go_stale_after_thirty_minutes() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");

    h.restart();
    assert!(h.run_state(&r1).is_open());

    // Exactly thirty minutes is not yet more than thirty.
    h.advance_minutes_with_pings(30);
    h.orch.tick().unwrap();
    assert!(h.run_state(&r1).is_open());

    h.advance_minutes_with_pings(1);
    h.orch.tick().unwrap();
    assert_eq!(h.closes(&r1), vec![CloseReason::StaleAfterRestart]);
    let failed = h
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::WorkerRunFailed)
        .and_then(|e| e.payload_as::<RunFailed>())
        .unwrap();
    assert_eq!(failed.reason, "stale_after_restart");
    assert_eq!(h.count(EventType::WorkerRunFailed), 1);
}

#[test]
fn restart_stale_check_leaves_runs_awaiting_review() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Warn, &["style"]);

    h.restart();
    h.advance_minutes_with_pings(31);
    h.orch.tick().unwrap();
    assert!(h.run_state(&r1).is_open());
    assert_eq!(h.count(EventType::WorkerRunFailed), 0);
}

#[test]
fn silent_worker_times_out_and_is_retried() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.advance_minutes_with_pings(31);
    h.orch.tick().unwrap();

    assert_eq!(h.closes(&r1), vec![CloseReason::WorkerTimeout]);
    let r2 = h.open_run("T1");
    assert_ne!(r1, r2);
    assert_eq!(h.orch.status().run(&r2).unwrap().attempt, 2);
}

#[test]
fn unresolved_review_expires_into_blocked() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Warn, &["style"]);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::NeedsHumanReview);

    h.advance_minutes_with_pings(59);
    h.orch.tick().unwrap();
    assert!(h.run_state(&r1).is_open());

    h.advance_minutes_with_pings(2);
    h.orch.tick().unwrap();
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictTimeout]);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Blocked);
    assert_eq!(h.orch.status().mode, Mode::Normal);
}

#[test]
fn human_override_resolves_a_warn() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Warn, &["style"]);
    h.human(HumanCommand::OverrideVerdict {
        task_id: t("T1"),
        run_id: r1.clone(),
        verdict: VerdictKind::Pass,
        note: Some("fine".into()),
    });
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Done);
    assert_eq!(h.closes(&r1), vec![CloseReason::VerdictPass]);
}

#[test]
fn abort_then_retry() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");

    let busy = h
        .orch
        .accept(SignalEnvelope::new(Actor::Human, Signal::Human(HumanCommand::RetryTask { task_id: t("T1"), note: None })))
        .unwrap_err();
    assert!(matches!(busy, OrchestratorError::Validation(ValidationError::NotApplicable(_))));

    h.human(HumanCommand::AbortRun { task_id: t("T1"), run_id: r1.clone(), note: None });
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Canceled);
    assert_eq!(h.closes(&r1), vec![CloseReason::Aborted]);
    assert!(h.orch.status().open_run(&t("T1")).is_none());

    h.human(HumanCommand::RetryTask { task_id: t("T1"), note: None });
    assert_ne!(h.open_run("T1"), r1);
}

#[test]
fn duplicate_signals_are_absorbed() {
    let mut h = Harness::new();
    let first = h.publish("T1", &[]);
    let before = h.orch.status().clone();
    let second = h.publish("T1", &[]);
    assert_eq!(second, Outcome::Duplicate { sequence: first.sequence().unwrap() });
    assert_eq!(h.orch.status(), &before);

    let mut changed = spec("T1", &[]);
    changed.goal = "something else".into();
    let err = h.orch.accept(SignalEnvelope::new(Actor::Planner, Signal::TaskSpec(changed))).unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(ValidationError::TaskAlreadyPublished(_))));
}

#[test]
fn human_commands_with_a_caller_key_apply_once() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.submit(Actor::Worker, Signal::Evidence(evidence_touching("T1", &r1, &["src/a.rs"], &["sudo rm x"])));
    assert_eq!(h.orch.status().mode, Mode::Halted);

    let resume = SignalEnvelope::new(Actor::Human, Signal::Human(HumanCommand::ResumeProject { note: None }))
        .with_key("resume-after-audit");
    let first = h.orch.accept(resume.clone()).unwrap();
    let second = h.orch.accept(resume).unwrap();
    assert!(matches!(first, Outcome::Appended { .. }));
    assert_eq!(second, Outcome::Duplicate { sequence: first.sequence().unwrap() });
    assert_eq!(h.count(EventType::ProjectResumed), 1);

    let err = h
        .orch
        .accept(SignalEnvelope::new(Actor::Human, Signal::Human(HumanCommand::ResumeProject { note: None })))
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(ValidationError::NotApplicable(_))));
}

#[test]
fn wrong_actor_is_rejected_without_logging() {
    let mut h = Harness::new();
    let before = h.events().len();
    let err = h
        .orch
        .accept(SignalEnvelope::new(Actor::Worker, Signal::TaskSpec(spec("T1", &[]))))
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(h.events().len(), before);
}

#[test]
fn failed_dispatch_is_retried_then_escalated() {
    let mut h = Harness::new();
    h.dispatcher.set_failing(true);
    h.publish("T1", &[]);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Pending);
    h.orch.tick().unwrap();
    h.orch.tick().unwrap();

    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::NeedsHumanReview);
    assert_eq!(h.count(EventType::WorkerRunFailed), 3);
    assert_eq!(h.count(EventType::WorkerRunStarted), 0);
    assert_eq!(h.count(EventType::ReviewRequested), 1);

    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WorkerRunIntent), 3);
}

#[test]
fn storage_failure_leaves_status_untouched() {
    let log = std::sync::Arc::new(FlakyLog::new());
    let mut orch = open_flaky(&log, &foreman_runtime::ManualClock::new(T0));
    let before = orch.status().clone();

    log.set_failing(true);
    let envelope = SignalEnvelope::new(Actor::Planner, Signal::TaskSpec(spec("T1", &[])));
    let err = orch.accept(envelope.clone()).unwrap_err();
    assert!(matches!(err, OrchestratorError::Storage(_)));
    assert_eq!(orch.status(), &before);

    log.set_failing(false);
    assert!(matches!(orch.accept(envelope).unwrap(), Outcome::Appended { .. }));
    assert_eq!(&orch.rebuild_status().unwrap(), orch.status());
}

#[test]
fn skill_and_tier_gates_hold_dispatch() {
    let mut config = OrchestratorConfig::default();
    config.dispatch.require_skill_decision = true;
    let mut h = Harness::with_config(config);

    h.publish("T1", &[]);
    assert!(h.orch.status().open_run(&t("T1")).is_none());
    assert!(h.orch.status().task(&t("T1")).unwrap().gates.contains(&Gate::AwaitingSkillDecision));
    h.human(HumanCommand::SelectSkill { task_id: t("T1"), skill: "rust".into() });
    assert!(h.orch.status().open_run(&t("T1")).is_some());
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().skill.as_deref(), Some("rust"));

    let mut risky = spec("T2", &[]);
    risky.risk_level = RiskLevel::High;
    risky.preferred_skill = Some("ops".into());
    h.submit(Actor::Planner, Signal::TaskSpec(risky));
    assert_eq!(h.count(EventType::PolicyTierRequested), 1);
    assert!(h.orch.status().open_run(&t("T2")).is_none());

    h.human(HumanCommand::ApproveTier { task_id: t("T2"), tier: "elevated".into(), note: None });
    let task = h.orch.status().task(&t("T2")).unwrap();
    assert_eq!(task.policy_tier.as_deref(), Some("elevated"));
    assert!(h.orch.status().open_run(&t("T2")).is_some());

    let err = h
        .orch
        .accept(SignalEnvelope::new(
            Actor::Human,
            Signal::Human(HumanCommand::ApproveTier { task_id: t("T2"), tier: "elevated".into(), note: None }),
        ))
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn dependencies_release_in_order() {
    let mut h = Harness::new();
    h.publish("T2", &["T1"]);
    h.publish("T1", &[]);
    assert!(h.orch.status().open_run(&t("T2")).is_none());

    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Pass, &[]);
    assert!(h.orch.status().open_run(&t("T2")).is_some());
}

#[test]
fn open_run_limit_caps_dispatch() {
    let mut config = OrchestratorConfig::default();
    config.dispatch.max_open_runs = 2;
    let mut h = Harness::with_config(config);
    for id in ["T1", "T2", "T3"] {
        h.publish(id, &[]);
    }
    assert_eq!(h.orch.status().open_runs().count(), 2);
    assert!(h.orch.status().open_run(&t("T3")).is_none());

    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Pass, &[]);
    assert!(h.orch.status().open_run(&t("T3")).is_some());
}

fn accept_ok(orch: &mut foreman_runtime::Orchestrator, actor: Actor, signal: Signal) -> Outcome {
    orch.accept(SignalEnvelope::new(actor, signal)).unwrap()
}

fn open_run_of(orch: &foreman_runtime::Orchestrator, task: &str) -> foreman_core::RunId {
    orch.status().open_run(&t(task)).unwrap().run_id.clone()
}

#[test]
fn redelivered_verdict_writes_the_halt_a_failed_append_lost() {
    let log = std::sync::Arc::new(FlakyLog::new());
    let mut orch = open_flaky(&log, &foreman_runtime::ManualClock::new(T0));
    accept_ok(&mut orch, Actor::Planner, Signal::TaskSpec(spec("T1", &[])));
    let r1 = open_run_of(&orch, "T1");
    accept_ok(&mut orch, Actor::Worker, Signal::Evidence(evidence("T1", &r1)));

    log.fail_once(EventType::ProjectHalted);
    let block = SignalEnvelope::new(
        Actor::Auditor,
        Signal::Verdict(verdict("T1", &r1, VerdictKind::Block, &["deny_command_used"])),
    );
    assert!(matches!(orch.accept(block.clone()).unwrap_err(), OrchestratorError::Storage(_)));
    assert_eq!(orch.status().mode, Mode::Normal);
    assert!(orch.status().run(&r1).unwrap().is_open());

    assert!(matches!(orch.accept(block).unwrap(), Outcome::Duplicate { .. }));
    assert_eq!(orch.status().mode, Mode::Halted);
    assert_eq!(
        orch.status().run(&r1).unwrap().state,
        RunState::Closed { reason: CloseReason::VerdictBlock }
    );

    accept_ok(&mut orch, Actor::Planner, Signal::TaskSpec(spec("T2", &[])));
    orch.tick().unwrap();
    assert!(orch.status().open_run(&t("T2")).is_none());
    assert_eq!(&orch.rebuild_status().unwrap(), orch.status());
}

#[test]
fn tick_closes_a_passed_run_whose_close_failed() {
    let log = std::sync::Arc::new(FlakyLog::new());
    let mut orch = open_flaky(&log, &foreman_runtime::ManualClock::new(T0));
    accept_ok(&mut orch, Actor::Planner, Signal::TaskSpec(spec("T1", &[])));
    let r1 = open_run_of(&orch, "T1");
    accept_ok(&mut orch, Actor::Worker, Signal::Evidence(evidence("T1", &r1)));

    log.fail_once(EventType::RunClosed);
    let pass = SignalEnvelope::new(Actor::Auditor, Signal::Verdict(verdict("T1", &r1, VerdictKind::Pass, &[])));
    assert!(orch.accept(pass).is_err());
    assert!(orch.status().run(&r1).unwrap().is_open());

    assert!(orch.tick().unwrap() > 0);
    assert_eq!(
        orch.status().run(&r1).unwrap().state,
        RunState::Closed { reason: CloseReason::VerdictPass }
    );
    assert_eq!(orch.status().phase, Phase::Finished);
}

#[test]
fn tick_writes_the_requeue_a_failed_append_lost() {
    let log = std::sync::Arc::new(FlakyLog::new());
    let mut orch = open_flaky(&log, &foreman_runtime::ManualClock::new(T0));
    accept_ok(&mut orch, Actor::Planner, Signal::TaskSpec(spec("T1", &[])));
    let r1 = open_run_of(&orch, "T1");
    accept_ok(&mut orch, Actor::Worker, Signal::Evidence(evidence("T1", &r1)));

    log.fail_once(EventType::TaskRequeued);
    let block = SignalEnvelope::new(Actor::Auditor, Signal::Verdict(verdict("T1", &r1, VerdictKind::Block, &["tests_failed"])));
    assert!(orch.accept(block).is_err());
    assert_eq!(orch.status().task(&t("T1")).unwrap().state, TaskState::Blocked);
    assert!(orch.status().open_run(&t("T1")).is_none());

    orch.tick().unwrap();
    let r2 = open_run_of(&orch, "T1");
    assert_ne!(r1, r2);
    assert_eq!(orch.status().run(&r2).unwrap().attempt, 2);

    orch.tick().unwrap();
    let requeued = orch.events().unwrap().iter().filter(|e| e.event_type == EventType::TaskRequeued).count();
    assert_eq!(requeued, 1);
}

#[test]
fn evidence_left_unscreened_by_a_failed_append_is_screened_on_tick() {
    let log = std::sync::Arc::new(FlakyLog::new());
    let mut orch = open_flaky(&log, &foreman_runtime::ManualClock::new(T0));
    accept_ok(&mut orch, Actor::Planner, Signal::TaskSpec(spec("T1", &[])));
    let r1 = open_run_of(&orch, "T1");

    log.fail_once(EventType::WatchdogVerdict);
    let tainted = evidence_touching("T1", &r1, &["src/a.rs"], &["cd build && sudo make install"]);
    assert!(orch.accept(SignalEnvelope::new(Actor::Worker, Signal::Evidence(tainted))).is_err());
    assert_eq!(orch.status().mode, Mode::Normal);

    orch.tick().unwrap();
    assert_eq!(orch.status().mode, Mode::Halted);
    assert_eq!(orch.status().halt_reason.as_deref(), Some("deny_command_used"));
    assert!(!orch.status().run(&r1).unwrap().is_open());
}

#[test]
fn finished_tasks_are_reported_once_and_finish_the_project() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Pass, &[]);

    let results = h.notifier.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].run_id, r1);
    assert_eq!(results[0].state, TaskState::Done);
    assert_eq!(results[0].verdict, Some(VerdictKind::Pass));
    let notified = h.events().into_iter().find(|e| e.event_type == EventType::ResultNotified).unwrap();
    assert_eq!(notified.idempotency_key, format!("demo:T1:{r1}:notified"));
    assert_eq!(h.orch.status().phase, Phase::Finished);
    assert_eq!(h.count(EventType::ProjectFinished), 1);

    h.restart();
    h.orch.tick().unwrap();
    assert_eq!(h.notifier.results().len(), 1);
    assert_eq!(h.count(EventType::ResultNotified), 1);
    assert_eq!(h.count(EventType::ProjectFinished), 1);

    h.publish("T2", &["T1"]);
    assert_eq!(h.orch.status().phase, Phase::Running);
    let r2 = h.open_run("T2");
    h.evidence("T2", &r2);
    h.verdict("T2", &r2, VerdictKind::Pass, &[]);
    assert_eq!(h.orch.status().phase, Phase::Finished);
    assert_eq!(h.count(EventType::ProjectFinished), 2);
    assert_eq!(h.notifier.results().len(), 2);
}

#[test]
fn finished_project_stops_watching_the_auditor() {
    let mut h = Harness::new();
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.evidence("T1", &r1);
    h.verdict("T1", &r1, VerdictKind::Pass, &[]);
    assert_eq!(h.orch.status().phase, Phase::Finished);

    h.clock.advance_minutes(10);
    h.orch.tick().unwrap();
    assert_eq!(h.count(EventType::WatchdogUnresponsive), 0);
    assert_eq!(h.orch.status().mode, Mode::Normal);
}

#[test]
fn blocked_result_is_reported_after_the_notifier_recovers() {
    let mut h = Harness::new();
    h.notifier.set_failing(true);
    h.publish("T1", &[]);
    let r1 = h.open_run("T1");
    h.submit(Actor::Worker, Signal::Evidence(evidence_touching("T1", &r1, &["src/a.rs"], &["sudo rm x"])));
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().state, TaskState::Blocked);
    assert_eq!(h.count(EventType::ResultNotified), 0);

    h.notifier.set_failing(false);
    h.orch.tick().unwrap();
    let results = h.notifier.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].state, TaskState::Blocked);
    assert_eq!(results[0].verdict, Some(VerdictKind::Block));
    assert_eq!(h.count(EventType::ResultNotified), 1);
    assert_eq!(h.orch.status().task(&t("T1")).unwrap().notified_run.as_ref(), Some(&r1));
    assert_eq!(h.orch.status().phase, Phase::Running);
}
