//! Projects known to this daemon, each served by its own control loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use foreman_core::{ProjectId, ValidationError};
use foreman_log::StatusCache;
use foreman_log_sqlite::SqliteEventLog;
use foreman_runtime::{LogOnlyDispatcher, LogOnlyNotifier, Orchestrator, OrchestratorConfig, ProjectHandle};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

const LOG_FILE: &str = "events.db";
const CACHE_FILE: &str = "status.json";

pub struct Registry {
    data_dir: PathBuf,
    config: OrchestratorConfig,
    tick_every: Option<Duration>,
    projects: RwLock<BTreeMap<ProjectId, ProjectHandle>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    /// `tick_every` of `None` leaves timers to explicit ticks, which tests rely on.
    pub fn new(data_dir: impl Into<PathBuf>, config: OrchestratorConfig, tick_every: Option<Duration>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config,
            tick_every,
            projects: RwLock::new(BTreeMap::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Open every project directory under the data dir so each one reconciles on startup.
    pub async fn open_existing(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .with_context(|| format!("read data dir {}", self.data_dir.display()))?;
        let mut opened = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let project = ProjectId::from(entry.file_name().to_string_lossy().into_owned());
            if !project.is_valid_name() || !entry.path().join(LOG_FILE).exists() {
                tracing::debug!(path = %entry.path().display(), "skipping non-project directory");
                continue;
            }
            self.get_or_open(&project).await?;
            opened += 1;
        }
        Ok(opened)
    }

    pub async fn get(&self, project: &ProjectId) -> Option<ProjectHandle> {
        self.projects.read().await.get(project).cloned()
    }

    /// The project's handle, starting its control loop first if needed.
    pub async fn get_or_open(&self, project: &ProjectId) -> Result<ProjectHandle> {
        if let Some(handle) = self.get(project).await {
            return Ok(handle);
        }
        if !project.is_valid_name() {
            return Err(ValidationError::InvalidProject(project.to_string()).into());
        }

        let mut projects = self.projects.write().await;
        if let Some(handle) = projects.get(project) {
            return Ok(handle.clone());
        }
        let dir = self.data_dir.join(project.as_str());
        let config = self.config.clone();
        let owner = project.clone();
        let orchestrator = tokio::task::spawn_blocking(move || -> Result<Orchestrator> {
            let log = SqliteEventLog::open(&dir.join(LOG_FILE), owner.clone())
                .with_context(|| format!("open event log for {owner}"))?;
            let orchestrator = Orchestrator::builder(log)
                .dispatcher(LogOnlyDispatcher)
                .notifier(LogOnlyNotifier)
                .config(config)
                .status_cache(StatusCache::new(dir.join(CACHE_FILE)))
                .open()
                .with_context(|| format!("start control loop for {owner}"))?;
            Ok(orchestrator)
        })
        .await
        .context("control loop startup panicked")??;

        let (handle, task) = ProjectHandle::spawn(orchestrator, self.tick_every);
        tracing::info!(project = %project, "project opened");
        projects.insert(project.clone(), handle.clone());
        self.loops.lock().await.push(task);
        Ok(handle)
    }

    pub async fn list(&self) -> Vec<ProjectId> {
        self.projects.read().await.keys().cloned().collect()
    }

    /// Stop every control loop after its queued requests and wait for it.
    pub async fn shutdown(&self) {
        let handles: Vec<ProjectHandle> = self.projects.read().await.values().cloned().collect();
        for handle in &handles {
            handle.shutdown().await;
        }
        for task in self.loops.lock().await.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "control loop ended abnormally");
            }
        }
    }
}
