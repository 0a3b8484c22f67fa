//! Core data model shared across the coordinator pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// Closed risk scale for proposals. The variant order is the apply-priority
/// order: critical work is applied first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

/// A proposed code change emitted by one specialist agent for one cycle.
/// Immutable once emitted: downstream stages clone, never mutate.
///
/// `risk_level` deserializes only from the closed set, so a malformed agent
/// payload fails construction instead of smuggling an unknown level through
/// the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub agent: String,
    pub title: String,
    pub description: String,
    /// Unified diff payload.
    pub diff: String,
    pub risk_level: RiskLevel,
    pub rationale: String,
    pub files_touched: Vec<String>,
    pub estimated_loc_change: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    FileChange,
    CiFailure,
    PeriodicScan,
    ManualTrigger,
    Debug,
}

/// An event that triggers an analysis cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientEvent {
    pub kind: EventKind,
    /// Event-specific payload (watcher path, CI logs, ...).
    pub data: Value,
    /// Task specification forwarded into the repo context.
    #[serde(default)]
    pub task_spec: Value,
}

impl AmbientEvent {
    pub fn new(kind: EventKind, data: Value, task_spec: Value) -> Self {
        Self {
            kind,
            data,
            task_spec,
        }
    }

    /// A synthesized periodic scan, used by `run_once` and the tick task.
    pub fn periodic_scan() -> Self {
        Self::new(
            EventKind::PeriodicScan,
            serde_json::json!({ "timestamp": crate::util::now_epoch() }),
            serde_json::json!({ "goal": "Periodic quality scan", "trigger": "periodic" }),
        )
    }

    pub fn is_ci_failure(&self) -> bool {
        self.kind == EventKind::CiFailure
    }
}

/// Bounded snapshot of the repository handed to every agent in a cycle.
/// Built once per cycle and shared by reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoContext {
    pub task: Value,
    pub tree: RepoTree,
    /// Configuration-file path → capped content.
    pub important_files: BTreeMap<String, String>,
    /// Impact-radius source path → capped content.
    pub impact_sources: BTreeMap<String, String>,
    pub failing_logs: String,
    pub current_diff: String,
    pub hot_paths: Vec<String>,
    pub conventions: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoTree {
    pub files: Vec<String>,
    pub total_files: usize,
}

/// Outcome of one verification check run in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_s: f64,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub reject_reason: String,
}

/// Result of running all verification checks after a patch application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub ok: bool,
    pub results: Vec<CheckResult>,
    pub duration_s: f64,
}

impl VerificationResult {
    /// ok ⇔ every entry passed (vacuously true for an empty list).
    pub fn from_results(results: Vec<CheckResult>) -> Self {
        let ok = results.iter().all(|r| r.ok);
        let duration_s = results.iter().map(|r| r.duration_s).sum();
        Self {
            ok,
            results,
            duration_s,
        }
    }
}

/// Result of an atomic patch application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub ok: bool,
    /// `git diff --cached --stat` summary of what was staged.
    pub stat: String,
    pub stderr: String,
    /// Distinguishes the reverse-check branch: `Some("already_applied")`
    /// when the diff was found to be present before any apply ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ApplyResult {
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            stat: String::new(),
            stderr: stderr.into(),
            status: None,
        }
    }
}

/// A dedicated worktree/branch pair for reviewing one proposal.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewCandidate {
    pub index: usize,
    pub title_slug: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub patch_path: PathBuf,
}
