use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use foreman_core::{EpochMs, Policy, SECOND_MS};

/// Runtime knobs for one project's control loop. Every field has a default, so an empty
/// `foreman.toml` is valid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub timers: TimerConfig,
    pub dispatch: DispatchConfig,
    pub policy: Policy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub heartbeat_timeout_secs: u64,
    pub verdict_timeout_secs: u64,
    pub stale_after_restart_secs: u64,
    pub worker_timeout_secs: u64,
    /// 0 disables review expiry.
    pub review_expiry_secs: u64,
    pub heartbeat_persist_secs: u64,
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 180,
            verdict_timeout_secs: 300,
            stale_after_restart_secs: 1800,
            worker_timeout_secs: 1800,
            review_expiry_secs: 3600,
            heartbeat_persist_secs: 60,
            tick_interval_ms: 1000,
        }
    }
}

impl TimerConfig {
    pub fn heartbeat_timeout(&self) -> EpochMs {
        secs(self.heartbeat_timeout_secs)
    }

    pub fn verdict_timeout(&self) -> EpochMs {
        secs(self.verdict_timeout_secs)
    }

    pub fn stale_after_restart(&self) -> EpochMs {
        secs(self.stale_after_restart_secs)
    }

    pub fn worker_timeout(&self) -> EpochMs {
        secs(self.worker_timeout_secs)
    }

    pub fn review_expiry(&self) -> Option<EpochMs> {
        (self.review_expiry_secs > 0).then(|| secs(self.review_expiry_secs))
    }

    pub fn heartbeat_persist(&self) -> EpochMs {
        secs(self.heartbeat_persist_secs)
    }
}

fn secs(s: u64) -> EpochMs {
    (s as EpochMs).saturating_mul(SECOND_MS)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on open runs across the project.
    pub max_open_runs: usize,
    /// Gate new tasks without a preferred skill until a human selects one.
    pub require_skill_decision: bool,
    pub require_tier_approval_for_high_risk: bool,
    /// Tier requested for high-risk tasks.
    pub high_risk_tier: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_open_runs: 4,
            require_skill_decision: false,
            require_tier_approval_for_high_risk: true,
            high_risk_tier: "elevated".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: OrchestratorConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Load `path` if given and present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load_from(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Fastest timer granularity worth ticking at.
    pub fn tick_interval_ms(&self) -> u64 {
        self.timers.tick_interval_ms.max(10)
    }
}
