//! Seam between the control loop and whatever actually runs workers.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use foreman_core::{ProjectId, RunId, TaskId, TaskSpec};

/// Everything a worker needs to pick up a run.
#[derive(Clone, Debug)]
pub struct DispatchRequest<'a> {
    pub project: &'a ProjectId,
    pub run_id: &'a RunId,
    pub attempt: u32,
    pub spec: &'a TaskSpec,
    pub skill: Option<&'a str>,
    pub policy_tier: Option<&'a str>,
}

/// Hands a run to a worker. The returned receipt is recorded on `WORKER_RUN_STARTED`; an
/// error fails the run with `dispatch_failed`.
pub trait WorkerDispatcher: Send + Sync {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<Option<String>>;
}

/// Workers poll the status endpoint for dispatched runs, so handing off is just a log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyDispatcher;

impl WorkerDispatcher for LogOnlyDispatcher {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<Option<String>> {
        tracing::info!(
            project = %request.project,
            task_id = %request.spec.task_id,
            run_id = %request.run_id,
            attempt = request.attempt,
            skill = request.skill.unwrap_or("-"),
            "run ready for worker"
        );
        Ok(None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchedRun {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub attempt: u32,
}

/// Records every dispatch and can be told to refuse them.
#[derive(Clone, Debug, Default)]
pub struct RecordingDispatcher {
    inner: Arc<Mutex<Recording>>,
}

#[derive(Debug, Default)]
struct Recording {
    runs: Vec<DispatchedRun>,
    failing: bool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<DispatchedRun> {
        self.inner.lock().map(|r| r.runs.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut r) = self.inner.lock() {
            r.failing = failing;
        }
    }
}

impl WorkerDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<Option<String>> {
        let mut r = self.inner.lock().map_err(|_| anyhow!("dispatcher lock poisoned"))?;
        if r.failing {
            return Err(anyhow!("no worker available for {}", request.spec.task_id));
        }
        r.runs.push(DispatchedRun {
            task_id: request.spec.task_id.clone(),
            run_id: request.run_id.clone(),
            attempt: request.attempt,
        });
        Ok(Some(format!("receipt-{}", r.runs.len())))
    }
}
