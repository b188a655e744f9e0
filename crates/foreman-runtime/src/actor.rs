//! One blocking thread per project owns its [`Orchestrator`]; everything else talks to it
//! through a [`ProjectHandle`]. Requests are served strictly in arrival order.
//!
//! Appends fsync, so the loop runs under `spawn_blocking` and never parks a runtime worker.
//! Timer firings come from a small async task that queues [`Command::Timer`] into the same
//! mailbox.

use std::time::Duration;

use foreman_core::{Actor, Event, ProjectId, ProjectStatus, Signal, SignalEnvelope};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, MissedTickBehavior};

use crate::{Orchestrator, OrchestratorError, Outcome};

const MAILBOX: usize = 256;

enum Command {
    Submit {
        envelope: SignalEnvelope,
        reply: oneshot::Sender<Result<Outcome, OrchestratorError>>,
    },
    Tick {
        reply: oneshot::Sender<Result<u64, OrchestratorError>>,
    },
    /// Periodic tick with nobody waiting on the result.
    Timer,
    Status {
        reply: oneshot::Sender<ProjectStatus>,
    },
    Events {
        reply: oneshot::Sender<Result<Vec<Event>, OrchestratorError>>,
    },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ProjectHandle {
    project: ProjectId,
    tx: mpsc::Sender<Command>,
}

impl ProjectHandle {
    /// Move `orchestrator` onto its own blocking thread. With `tick_every`, timers fire on that
    /// interval; without it they only fire on [`ProjectHandle::tick`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(orchestrator: Orchestrator, tick_every: Option<Duration>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX);
        if let Some(every) = tick_every {
            tokio::spawn(ticker(tx.downgrade(), every, orchestrator.project().clone()));
        }
        let handle = Self { project: orchestrator.project().clone(), tx };
        let task = tokio::task::spawn_blocking(move || run(orchestrator, rx));
        (handle, task)
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub async fn submit(&self, envelope: SignalEnvelope) -> Result<Outcome, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { envelope, reply }).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn ping(&self) -> Result<Outcome, OrchestratorError> {
        self.submit(SignalEnvelope::new(Actor::Auditor, Signal::Ping)).await
    }

    pub async fn tick(&self) -> Result<u64, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Tick { reply }).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn status(&self) -> Result<ProjectStatus, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| self.stopped())
    }

    pub async fn events(&self) -> Result<Vec<Event>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Events { reply }).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// Ask the loop to stop after the requests already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.tx.send(command).await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> OrchestratorError {
        OrchestratorError::Stopped(self.project.clone())
    }
}

fn run(mut orch: Orchestrator, mut rx: mpsc::Receiver<Command>) {
    tracing::info!(project = %orch.project(), "control loop started");
    while let Some(command) = rx.blocking_recv() {
        if matches!(command, Command::Shutdown) {
            break;
        }
        serve(&mut orch, command);
    }
    tracing::info!(project = %orch.project(), "control loop stopped");
}

fn serve(orch: &mut Orchestrator, command: Command) {
    // A dropped receiver means the caller gave up; the work is done either way.
    match command {
        Command::Submit { envelope, reply } => {
            let _ = reply.send(orch.accept(envelope));
        }
        Command::Tick { reply } => {
            let _ = reply.send(orch.tick());
        }
        Command::Timer => {
            if let Err(e) = orch.tick() {
                tracing::warn!(project = %orch.project(), error = %e, "tick failed");
            }
        }
        Command::Status { reply } => {
            let _ = reply.send(orch.status().clone());
        }
        Command::Events { reply } => {
            let _ = reply.send(orch.events());
        }
        Command::Shutdown => {}
    }
}

/// Queue a timer firing every `every` until the loop stops or every handle is gone. A full
/// mailbox skips the firing; the next one covers it.
async fn ticker(tx: mpsc::WeakSender<Command>, every: Duration, project: ProjectId) {
    let mut t = interval(every);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        t.tick().await;
        let Some(tx) = tx.upgrade() else { break };
        match tx.try_send(Command::Timer) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::debug!(project = %project, "mailbox full, timer skipped"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
