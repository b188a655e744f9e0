use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use foreman_core::{reduce, Actor, HumanCommand, ProjectStatus, RunId, Signal, SignalEnvelope, TaskId, VerdictKind};
use foreman_log::EventLog;
use foreman_log_sqlite::SqliteEventLog;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "foremanctl", version, about = "Talk to a foreman daemon, or inspect a log offline")]
struct Args {
    /// Daemon base URL.
    #[arg(long, global = true, default_value = "http://127.0.0.1:7420")]
    daemon: String,

    /// Project to address.
    #[arg(long, short, global = true, default_value = "default")]
    project: String,

    /// Caller idempotency key for human commands; repeating it is a no-op.
    #[arg(long, global = true)]
    key: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the project status.
    Status,
    /// Print every event in the project log.
    Events,
    /// Submit a signal envelope read from a JSON file.
    Submit { file: PathBuf },
    /// Send an auditor heartbeat.
    Ping,
    SelectSkill {
        task: String,
        skill: String,
    },
    ApproveTier {
        task: String,
        tier: String,
        #[arg(long)]
        note: Option<String>,
    },
    Override {
        task: String,
        run: String,
        #[arg(value_enum)]
        verdict: OverrideVerdict,
        #[arg(long)]
        note: Option<String>,
    },
    Resume {
        #[arg(long)]
        note: Option<String>,
    },
    Restore {
        #[arg(long)]
        note: Option<String>,
    },
    Retry {
        task: String,
        #[arg(long)]
        note: Option<String>,
    },
    Abort {
        task: String,
        run: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Fold a SQLite event log without a daemon. Never writes.
    Replay {
        #[arg(long)]
        db: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OverrideVerdict {
    Pass,
    Block,
}

impl From<OverrideVerdict> for VerdictKind {
    fn from(v: OverrideVerdict) -> Self {
        match v {
            OverrideVerdict::Pass => VerdictKind::Pass,
            OverrideVerdict::Block => VerdictKind::Block,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = format!("{}/v1/projects/{}", args.daemon.trim_end_matches('/'), args.project);

    let out: Value = match args.cmd {
        Cmd::Status => expect_ok(client.get(format!("{base}/status")).send().await?).await?,
        Cmd::Events => expect_ok(client.get(format!("{base}/events")).send().await?).await?,
        Cmd::Submit { file } => {
            let bytes = tokio::fs::read(&file).await.with_context(|| format!("read {}", file.display()))?;
            let envelope: SignalEnvelope =
                serde_json::from_slice(&bytes).with_context(|| format!("parse {}", file.display()))?;
            expect_ok(client.post(format!("{base}/signals")).json(&envelope).send().await?).await?
        }
        Cmd::Ping => expect_ok(client.post(format!("{base}/ping?actor=auditor")).send().await?).await?,
        Cmd::Replay { db } => {
            let (status, corrupted) = replay(&db)?;
            if corrupted > 0 {
                eprintln!("warning: {corrupted} corrupted entries skipped");
            }
            serde_json::to_value(status)?
        }
        human => {
            let Some(command) = human_command(human) else { bail!("not a human command") };
            let mut envelope = SignalEnvelope::new(Actor::Human, Signal::Human(command));
            if let Some(key) = args.key {
                envelope = envelope.with_key(key);
            }
            expect_ok(client.post(format!("{base}/signals")).json(&envelope).send().await?).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn human_command(cmd: Cmd) -> Option<HumanCommand> {
    let command = match cmd {
        Cmd::SelectSkill { task, skill } => HumanCommand::SelectSkill { task_id: TaskId::from(task), skill },
        Cmd::ApproveTier { task, tier, note } => HumanCommand::ApproveTier { task_id: TaskId::from(task), tier, note },
        Cmd::Override { task, run, verdict, note } => HumanCommand::OverrideVerdict {
            task_id: TaskId::from(task),
            run_id: RunId::from(run),
            verdict: verdict.into(),
            note,
        },
        Cmd::Resume { note } => HumanCommand::ResumeProject { note },
        Cmd::Restore { note } => HumanCommand::RestoreMode { note },
        Cmd::Retry { task, note } => HumanCommand::RetryTask { task_id: TaskId::from(task), note },
        Cmd::Abort { task, run, note } => HumanCommand::AbortRun {
            task_id: TaskId::from(task),
            run_id: RunId::from(run),
            note,
        },
        Cmd::Status | Cmd::Events | Cmd::Submit { .. } | Cmd::Ping | Cmd::Replay { .. } => return None,
    };
    Some(command)
}

/// Fold the log at `db` into a status. Returns the number of entries that failed verification.
fn replay(db: &Path) -> anyhow::Result<(ProjectStatus, usize)> {
    let log = SqliteEventLog::open_read_only(db).with_context(|| format!("open {}", db.display()))?;
    let replay = log.read_all().context("read event log")?;
    Ok((reduce(log.project(), &replay.events), replay.corrupted.len()))
}

async fn expect_ok(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("daemon answered {status}: {}", body["error"].as_str().unwrap_or("no detail"));
    }
    Ok(body)
}
