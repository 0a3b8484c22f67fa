//! Append-only structured telemetry.
//!
//! One JSON record per line: `{timestamp, run_id, type, data}`. The
//! coordinator process is the single writer; record-level atomicity relies on
//! the operating system's append semantics, nothing more. Sink errors are
//! logged and swallowed so telemetry can never take down a cycle.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tracing::warn;

use crate::config::TelemetryConfig;
use crate::protocol::Proposal;
use crate::redaction::DEFAULT_REDACT_LEN;
use crate::redaction::redact_text;
use crate::util::now_epoch;

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    path: PathBuf,
    enabled: bool,
    include_diffs: bool,
    retention_days: u64,
}

impl TelemetrySink {
    pub fn new(repo_root: &Path, config: &TelemetryConfig) -> Self {
        Self {
            path: repo_root.join(&config.log_path),
            enabled: config.enabled,
            include_diffs: config.include_diffs,
            retention_days: config.retention_days,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event record. Best-effort: failures are logged, not raised.
    pub fn log(&self, run_id: &str, event_type: &str, data: Value) {
        if !self.enabled {
            return;
        }
        let entry = json!({
            "timestamp": now_epoch(),
            "run_id": run_id,
            "type": event_type,
            "data": data,
        });
        if let Err(err) = self.append_line(&entry) {
            warn!("telemetry append failed: {err}");
        }
    }

    fn append_line(&self, entry: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(entry).unwrap_or_default();
        line.push('\n');
        file.write_all(line.as_bytes())
    }

    /// Unlink the log file when its last write predates the retention window.
    /// Called at cycle start.
    pub fn prune_if_stale(&self) {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return;
        };
        let Ok(modified) = metadata.modified() else {
            return;
        };
        let retention = Duration::from_secs(self.retention_days * 24 * 3600);
        let stale = SystemTime::now()
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if stale && let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to prune stale telemetry log: {err}");
        }
    }

    /// Event payload for a `proposal` record. The diff itself never lands in
    /// telemetry; with `include_diffs` on, a hash and a bounded redacted
    /// excerpt are stored instead.
    pub fn proposal_data(&self, proposal: &Proposal) -> Value {
        let mut data = json!({
            "agent": proposal.agent,
            "title": proposal.title,
            "risk_level": proposal.risk_level,
            "files_touched": proposal.files_touched,
            "estimated_loc_change": proposal.estimated_loc_change,
        });
        if self.include_diffs {
            let digest = Sha256::digest(proposal.diff.as_bytes());
            data["diff_sha256"] = json!(format!("{digest:x}"));
            data["diff_len"] = json!(proposal.diff.len());
            data["diff_excerpt"] = json!(redact_text(&proposal.diff, DEFAULT_REDACT_LEN));
        }
        data
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::RiskLevel;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sink(root: &Path, include_diffs: bool) -> TelemetrySink {
        TelemetrySink::new(
            root,
            &TelemetryConfig {
                include_diffs,
                ..TelemetryConfig::default()
            },
        )
    }

    fn sample_proposal() -> Proposal {
        Proposal {
            agent: "SecurityGuardian".to_string(),
            title: "Remove hardcoded key".to_string(),
            description: "d".to_string(),
            diff: "--- a/x\n+++ b/x\n".to_string(),
            risk_level: RiskLevel::Low,
            rationale: "r".to_string(),
            files_touched: vec!["x".to_string()],
            estimated_loc_change: 2,
            tags: vec!["security".to_string()],
        }
    }

    #[test]
    fn appends_one_json_record_per_line() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(tmp.path(), false);
        sink.log("run1", "cycle_started", json!({"queue_depth": 0}));
        sink.log("run1", "cycle_completed", json!({"status": "success"}));

        let contents = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["run_id"], "run1");
        assert_eq!(first["type"], "cycle_started");
        assert!(first["timestamp"].as_f64().is_some());
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let sink = TelemetrySink::new(
            tmp.path(),
            &TelemetryConfig {
                enabled: false,
                ..TelemetryConfig::default()
            },
        );
        sink.log("run1", "cycle_started", json!({}));
        assert!(!sink.path().exists());
    }

    #[test]
    fn proposal_data_omits_diff_by_default() {
        let tmp = TempDir::new().unwrap();
        let data = sink(tmp.path(), false).proposal_data(&sample_proposal());
        assert!(data.get("diff_sha256").is_none());
        assert!(data.get("diff_excerpt").is_none());
        assert_eq!(data["agent"], "SecurityGuardian");
    }

    #[test]
    fn proposal_data_hashes_diff_when_enabled() {
        let tmp = TempDir::new().unwrap();
        let data = sink(tmp.path(), true).proposal_data(&sample_proposal());
        let digest = data["diff_sha256"].as_str().unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(data["diff_len"], 16);
    }

    #[test]
    fn prune_keeps_fresh_logs() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(tmp.path(), false);
        sink.log("run1", "cycle_started", json!({}));
        sink.prune_if_stale();
        assert!(sink.path().exists());
    }
}
