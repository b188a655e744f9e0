//! Policy gate: pure decisions over verdicts, evidence and failures.
//!
//! Nothing here touches the log. The control loop turns each decision into events.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::reason;
use crate::{EvidenceChain, Verdict, VerdictKind};

/// Per-project guardrails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Absolute project root. When set, evidence must stay inside it as well as inside the
    /// worker-reported repo root.
    pub project_root: Option<PathBuf>,
    /// Path prefixes, relative to the repo root, that workers must not modify.
    pub deny_paths: Vec<String>,
    /// Commands that must never appear in evidence. A rule matches when its words lead any
    /// command of a shell line, after `&&`, `||`, `;`, `|` or a newline.
    pub deny_commands: Vec<String>,
    /// Non-fatal BLOCKs and worker failures requeue a task while it has had fewer runs than this.
    pub max_attempts: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            project_root: None,
            deny_paths: vec![".git".into()],
            deny_commands: vec![
                "rm -rf /".into(),
                "sudo".into(),
                "git push --force".into(),
                "git reset --hard".into(),
                "mkfs".into(),
                "dd".into(),
            ],
            max_attempts: 3,
        }
    }
}

/// BLOCK reasons that halt the whole project.
pub const FATAL_REASONS: &[&str] = &[reason::PATH_OUTSIDE_PROJECT, reason::DENY_COMMAND_USED];

pub fn is_fatal(code: &str) -> bool {
    FATAL_REASONS.contains(&code)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back to PENDING for another run.
    Requeue,
    /// Retries exhausted; a human decides.
    Escalate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerdictDecision {
    /// Task is done; close the run as passed.
    Accept,
    /// Leave the run open and wait for a human.
    HumanReview,
    /// Close the run as blocked and halt the project.
    Halt { reason: String },
    /// Close the run as blocked, then retry or escalate.
    Block(RetryDecision),
}

/// Decide what a verdict means for a task that has had `attempts` runs so far.
#[must_use]
pub fn decide_verdict(verdict: &Verdict, attempts: u32, policy: &Policy) -> VerdictDecision {
    match verdict.verdict {
        VerdictKind::Pass => VerdictDecision::Accept,
        VerdictKind::Warn => VerdictDecision::HumanReview,
        VerdictKind::Block => match verdict.reasons.iter().find(|r| is_fatal(r)) {
            Some(fatal) => VerdictDecision::Halt { reason: fatal.clone() },
            None => VerdictDecision::Block(decide_retry(attempts, policy)),
        },
    }
}

#[must_use]
pub fn decide_retry(attempts: u32, policy: &Policy) -> RetryDecision {
    if attempts < policy.max_attempts {
        RetryDecision::Requeue
    } else {
        RetryDecision::Escalate
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub detail: String,
}

impl Violation {
    fn new(code: &str, detail: impl Into<String>) -> Self {
        Self { code: code.to_string(), detail: detail.into() }
    }
}

/// Check the evidence's path-safety report and commands. Lexical only; nothing is read
/// from disk.
pub fn screen_evidence(evidence: &EvidenceChain, policy: &Policy) -> Vec<Violation> {
    let mut out = Vec::new();
    let safety = &evidence.path_safety;
    let repo_root = normalize_path(Path::new(&safety.repo_root));

    if !repo_root.is_absolute() {
        out.push(Violation::new(
            reason::PATH_OUTSIDE_PROJECT,
            format!("repo root '{}' is not absolute", safety.repo_root),
        ));
        return out;
    }
    if let Some(project_root) = &policy.project_root {
        if !is_within(&normalize_path(project_root), &repo_root) {
            out.push(Violation::new(
                reason::PATH_OUTSIDE_PROJECT,
                format!("repo root '{}' is outside project root '{}'", repo_root.display(), project_root.display()),
            ));
        }
    }

    let pwd = resolve_against(&repo_root, &safety.pwd);
    if !is_within(&repo_root, &pwd) {
        out.push(Violation::new(
            reason::PATH_OUTSIDE_PROJECT,
            format!("working directory '{}' is outside '{}'", pwd.display(), repo_root.display()),
        ));
    }

    for file in &safety.changed_files {
        let resolved = resolve_against(&repo_root, file);
        if !is_within(&repo_root, &resolved) {
            out.push(Violation::new(
                reason::PATH_OUTSIDE_PROJECT,
                format!("changed file '{file}' is outside '{}'", repo_root.display()),
            ));
            continue;
        }
        let denied = policy
            .deny_paths
            .iter()
            .any(|deny| is_within(&resolve_against(&repo_root, deny), &resolved));
        if denied {
            out.push(Violation::new(reason::DENY_PATH_TOUCHED, format!("changed file '{file}' is protected")));
        }
    }

    for command in &evidence.commands {
        let cmd = command.cmd.trim();
        let denied = command_words(cmd).find_map(|words| {
            policy.deny_commands.iter().find(|rule| leads_with(&words, rule))
        });
        if let Some(deny) = denied {
            out.push(Violation::new(
                reason::DENY_COMMAND_USED,
                format!("command '{cmd}' matches deny rule '{deny}'"),
            ));
        }
    }

    out
}

/// Build the orchestrator's own BLOCK verdict from screening violations.
pub fn verdict_from_violations(evidence: &EvidenceChain, violations: &[Violation]) -> Option<Verdict> {
    if violations.is_empty() {
        return None;
    }
    let mut reasons: Vec<String> = Vec::new();
    for v in violations {
        if !reasons.contains(&v.code) {
            reasons.push(v.code.clone());
        }
    }
    // Fatal codes first so the halt reason is stable.
    reasons.sort_by_key(|r| !is_fatal(r));
    Some(Verdict {
        task_id: evidence.task_id.clone(),
        run_id: evidence.run_id.clone(),
        verdict: VerdictKind::Block,
        reasons,
        suggested_actions: vec!["inspect the worker's changes before resuming".into()],
        details: Some(violations.iter().map(|v| v.detail.as_str()).collect::<Vec<_>>().join("; ")),
    })
}

/// Words of each command in a shell line, with leading `NAME=value` assignments dropped.
fn command_words(line: &str) -> impl Iterator<Item = Vec<&str>> {
    line.split(|c: char| matches!(c, '&' | '|' | ';' | '\n'))
        .map(|segment| {
            segment
                .split_whitespace()
                .skip_while(|word| is_env_assignment(word))
                .collect::<Vec<_>>()
        })
        .filter(|words| !words.is_empty())
}

fn is_env_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

fn leads_with(words: &[&str], rule: &str) -> bool {
    let rule: Vec<&str> = rule.split_whitespace().collect();
    !rule.is_empty() && words.len() >= rule.len() && words[..rule.len()] == rule[..]
}

fn resolve_against(root: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&root.join(path))
    }
}

/// Normalize a path lexically (no filesystem access).
pub fn normalize_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::Normal(s) => out.push(s),
        }
    }
    out
}

pub fn is_within(parent: &Path, child: &Path) -> bool {
    let parent = parent.components().collect::<Vec<_>>();
    let child = child.components().collect::<Vec<_>>();
    child.len() >= parent.len() && child[..parent.len()] == parent[..]
}
