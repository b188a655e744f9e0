//! Where finished task outcomes are reported.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use foreman_core::{ProjectId, RunId, TaskId, TaskState, VerdictKind};

/// A task that reached DONE or a final BLOCKED on its last run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult {
    pub project: ProjectId,
    pub task_id: TaskId,
    pub run_id: RunId,
    pub state: TaskState,
    pub verdict: Option<VerdictKind>,
    pub failure_reason: Option<String>,
}

impl TaskResult {
    pub fn message(&self) -> String {
        match (&self.state, &self.failure_reason) {
            (TaskState::Done, _) => format!("[{}] {} done", self.project, self.task_id),
            (_, Some(why)) => format!("[{}] {} blocked: {why}", self.project, self.task_id),
            (_, None) => format!("[{}] {} blocked", self.project, self.task_id),
        }
    }
}

/// Delivers a result. An error leaves the result unreported, so it is offered again on the
/// next pass of the loop.
pub trait ResultNotifier: Send + Sync {
    fn notify(&self, result: &TaskResult) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyNotifier;

impl ResultNotifier for LogOnlyNotifier {
    fn notify(&self, result: &TaskResult) -> Result<()> {
        tracing::info!(
            project = %result.project,
            task_id = %result.task_id,
            run_id = %result.run_id,
            state = ?result.state,
            "{}",
            result.message()
        );
        Ok(())
    }
}

/// Keeps every result it is given; can be told to refuse them.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    inner: Arc<Mutex<Delivered>>,
}

#[derive(Debug, Default)]
struct Delivered {
    results: Vec<TaskResult>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.inner.lock().map(|d| d.results.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut d) = self.inner.lock() {
            d.failing = failing;
        }
    }
}

impl ResultNotifier for RecordingNotifier {
    fn notify(&self, result: &TaskResult) -> Result<()> {
        let mut d = self.inner.lock().map_err(|_| anyhow!("notifier lock poisoned"))?;
        if d.failing {
            return Err(anyhow!("notification channel down"));
        }
        d.results.push(result.clone());
        Ok(())
    }
}
