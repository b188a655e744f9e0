#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreman_core::{
    Actor, CloseReason, Event, EventType, EvidenceChain, EvidenceCommand, EvidenceStatus, HumanCommand,
    NewEvent, PathSafety, ProjectId, RiskLevel, RunId, RunState, Signal, SignalEnvelope, TaskId, TaskKind,
    TaskSpec, Verdict, VerdictKind,
};
use foreman_log::{AppendOutcome, EventLog, InMemoryEventLog, Replay, StorageError};
use foreman_runtime::{ManualClock, Orchestrator, OrchestratorConfig, RecordingDispatcher, RecordingNotifier};

pub const T0: i64 = 1_700_000_000_000;

pub fn project() -> ProjectId {
    ProjectId::from("demo")
}

pub struct Harness {
    pub log: Arc<InMemoryEventLog>,
    pub clock: ManualClock,
    pub dispatcher: RecordingDispatcher,
    pub notifier: RecordingNotifier,
    pub config: OrchestratorConfig,
    pub orch: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let log = Arc::new(InMemoryEventLog::new(project()));
        let clock = ManualClock::new(T0);
        let dispatcher = RecordingDispatcher::new();
        let notifier = RecordingNotifier::new();
        let orch = open(&log, &clock, &dispatcher, &notifier, &config);
        Self { log, clock, dispatcher, notifier, config, orch }
    }

    /// Drop the running loop and start a new one over the same log, as after a crash.
    pub fn restart(&mut self) {
        self.orch = open(&self.log, &self.clock, &self.dispatcher, &self.notifier, &self.config);
    }

    pub fn events(&self) -> Vec<Event> {
        self.orch.events().unwrap()
    }

    pub fn count(&self, ty: EventType) -> usize {
        self.events().iter().filter(|e| e.event_type == ty).count()
    }

    pub fn closes(&self, run: &RunId) -> Vec<CloseReason> {
        self.events()
            .iter()
            .filter(|e| e.event_type == EventType::RunClosed && e.run_id.as_ref() == Some(run))
            .filter_map(|e| e.payload_as::<foreman_core::payload::RunClosed>())
            .map(|p| p.close_reason)
            .collect()
    }

    pub fn open_run(&self, task: &str) -> RunId {
        self.orch
            .status()
            .open_run(&TaskId::from(task))
            .map(|r| r.run_id.clone())
            .unwrap_or_else(|| panic!("task {task} has no open run"))
    }

    pub fn run_state(&self, run: &RunId) -> RunState {
        self.orch.status().run(run).unwrap().state
    }

    pub fn submit(&mut self, actor: Actor, signal: Signal) -> foreman_runtime::Outcome {
        self.orch.accept(SignalEnvelope::new(actor, signal)).unwrap()
    }

    pub fn publish(&mut self, task: &str, deps: &[&str]) -> foreman_runtime::Outcome {
        self.submit(Actor::Planner, Signal::TaskSpec(spec(task, deps)))
    }

    pub fn evidence(&mut self, task: &str, run: &RunId) -> foreman_runtime::Outcome {
        self.submit(Actor::Worker, Signal::Evidence(evidence(task, run)))
    }

    pub fn verdict(&mut self, task: &str, run: &RunId, kind: VerdictKind, reasons: &[&str]) -> foreman_runtime::Outcome {
        self.submit(Actor::Auditor, Signal::Verdict(verdict(task, run, kind, reasons)))
    }

    pub fn human(&mut self, command: HumanCommand) -> foreman_runtime::Outcome {
        self.submit(Actor::Human, Signal::Human(command))
    }

    pub fn ping(&mut self) -> foreman_runtime::Outcome {
        self.submit(Actor::Auditor, Signal::Ping)
    }

    /// Keep the auditor looking alive while time passes.
    pub fn advance_minutes_with_pings(&mut self, minutes: i64) {
        for _ in 0..minutes {
            self.clock.advance_minutes(1);
            self.ping();
        }
    }
}

fn open(
    log: &Arc<InMemoryEventLog>,
    clock: &ManualClock,
    dispatcher: &RecordingDispatcher,
    notifier: &RecordingNotifier,
    config: &OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::builder(Arc::clone(log))
        .clock(clock.clone())
        .dispatcher(dispatcher.clone())
        .notifier(notifier.clone())
        .config(config.clone())
        .open()
        .unwrap()
}

pub fn spec(task: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        task_id: TaskId::from(task),
        goal: format!("finish {task}"),
        kind: TaskKind::Coding,
        acceptance: vec!["tests pass".into()],
        dependencies: deps.iter().map(|d| TaskId::from(*d)).collect(),
        context_files: vec![],
        risk_level: RiskLevel::Low,
        suggested_skills: vec![],
        preferred_skill: None,
    }
}

pub fn evidence(task: &str, run: &RunId) -> EvidenceChain {
    evidence_touching(task, run, &["src/lib.rs"], &["cargo test"])
}

pub fn evidence_touching(task: &str, run: &RunId, changed: &[&str], commands: &[&str]) -> EvidenceChain {
    EvidenceChain {
        task_id: TaskId::from(task),
        run_id: run.clone(),
        files: changed.iter().map(|s| s.to_string()).collect(),
        commands: commands
            .iter()
            .map(|c| EvidenceCommand { cmd: c.to_string(), output: Some("ok".into()) })
            .collect(),
        diff_ref: None,
        validation_command: Some("cargo test".into()),
        path_safety: PathSafety {
            pwd: "/work/repo".into(),
            repo_root: "/work/repo".into(),
            changed_files: changed.iter().map(|s| s.to_string()).collect(),
        },
        key_lines: vec![],
        blocking_issues: vec![],
        status: EvidenceStatus::Done,
    }
}

pub fn verdict(task: &str, run: &RunId, kind: VerdictKind, reasons: &[&str]) -> Verdict {
    Verdict {
        task_id: TaskId::from(task),
        run_id: run.clone(),
        verdict: kind,
        reasons: reasons.iter().map(|s| s.to_string()).collect(),
        suggested_actions: vec![],
        details: None,
    }
}

/// An in-memory log whose writes can be made to fail, all at once or one event type once.
pub struct FlakyLog {
    pub inner: InMemoryEventLog,
    pub failing: AtomicBool,
    pub fail_next: Mutex<Option<EventType>>,
}

impl FlakyLog {
    pub fn new() -> Self {
        Self {
            inner: InMemoryEventLog::new(project()),
            failing: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next append of `event_type`, then behave again.
    pub fn fail_once(&self, event_type: EventType) {
        *self.fail_next.lock().unwrap() = Some(event_type);
    }
}

impl EventLog for FlakyLog {
    fn project(&self) -> &ProjectId {
        self.inner.project()
    }

    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".into()));
        }
        {
            let mut next = self.fail_next.lock().unwrap();
            if next.as_ref() == Some(&event.event_type) {
                *next = None;
                return Err(StorageError::Unavailable("disk full".into()));
            }
        }
        self.inner.append(event)
    }

    fn read_all(&self) -> Result<Replay, StorageError> {
        self.inner.read_all()
    }

    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError> {
        self.inner.sequence_for_key(key)
    }
}

pub fn open_flaky(log: &Arc<FlakyLog>, clock: &ManualClock) -> Orchestrator {
    Orchestrator::builder(Arc::clone(log))
        .clock(clock.clone())
        .dispatcher(RecordingDispatcher::new())
        .open()
        .unwrap()
}

/// An in-memory log that takes `delay` for every append, like a slow disk sync.
pub struct SlowLog {
    pub inner: InMemoryEventLog,
    pub delay: Duration,
}

impl SlowLog {
    pub fn new(delay: Duration) -> Self {
        Self { inner: InMemoryEventLog::new(project()), delay }
    }
}

impl EventLog for SlowLog {
    fn project(&self) -> &ProjectId {
        self.inner.project()
    }

    fn append(&self, event: NewEvent) -> Result<AppendOutcome, StorageError> {
        std::thread::sleep(self.delay);
        self.inner.append(event)
    }

    fn read_all(&self) -> Result<Replay, StorageError> {
        self.inner.read_all()
    }

    fn sequence_for_key(&self, key: &str) -> Result<Option<u64>, StorageError> {
        self.inner.sequence_for_key(key)
    }
}
