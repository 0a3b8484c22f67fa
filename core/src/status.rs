//! Windowed operational metrics derived from the telemetry log.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::util::now_epoch;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub window_seconds: f64,
    pub telemetry_path: String,
    pub proposals_per_hour: f64,
    pub apply_success_rate: Option<f64>,
    pub verify_success_rate: Option<f64>,
    pub queue_depth_p95: Option<f64>,
    pub queue_depth_max: Option<i64>,
    pub cycle_latency_s_p50: Option<f64>,
    pub cycle_latency_s_p95: Option<f64>,
    pub last_cycle: Option<Value>,
}

impl StatusReport {
    /// Health verdict for `status --health`: unhealthy when the most recent
    /// completed cycle errored, or when applies are mostly failing.
    pub fn healthy(&self) -> bool {
        if let Some(last) = &self.last_cycle
            && last["data"]["status"] == "error"
        {
            return false;
        }
        if let Some(rate) = self.apply_success_rate
            && rate < 0.5
        {
            return false;
        }
        true
    }
}

pub fn compute_status(telemetry_path: &Path, window_seconds: f64) -> StatusReport {
    compute_status_at(telemetry_path, window_seconds, now_epoch())
}

/// Like [`compute_status`] with an explicit "now", for deterministic tests.
pub fn compute_status_at(telemetry_path: &Path, window_seconds: f64, now: f64) -> StatusReport {
    let events = read_events(telemetry_path);
    let cutoff = now - window_seconds;
    let recent: Vec<&Value> = events
        .iter()
        .filter(|e| e["timestamp"].as_f64().unwrap_or(0.0) >= cutoff)
        .collect();

    let count = |kind: &str| recent.iter().filter(|e| e["type"] == kind).count();
    let proposals = count("proposal");
    let apply_ok = count("apply_succeeded");
    let apply_fail = count("apply_failed");
    let verify_ok = count("verify_succeeded");
    let verify_fail = count("verify_failed");

    // Pair cycle_started/cycle_completed by run_id for latency; queue depth
    // comes from cycle_started payloads.
    let mut starts: std::collections::HashMap<&str, f64> = std::collections::HashMap::new();
    let mut latencies: Vec<f64> = Vec::new();
    let mut queue_depths: Vec<i64> = Vec::new();
    for event in &recent {
        let run_id = event["run_id"].as_str().unwrap_or("");
        let ts = event["timestamp"].as_f64().unwrap_or(0.0);
        match event["type"].as_str() {
            Some("cycle_started") => {
                starts.insert(run_id, ts);
                if let Some(depth) = event["data"]["queue_depth"].as_i64() {
                    queue_depths.push(depth);
                }
            }
            Some("cycle_completed") => {
                if let Some(start) = starts.get(run_id) {
                    latencies.push((ts - start).max(0.0));
                }
            }
            _ => {}
        }
    }

    let last_cycle = events
        .iter()
        .rev()
        .find(|e| e["type"] == "cycle_completed")
        .cloned();

    let depth_f: Vec<f64> = queue_depths.iter().map(|&d| d as f64).collect();
    StatusReport {
        window_seconds,
        telemetry_path: telemetry_path.display().to_string(),
        proposals_per_hour: if window_seconds > 0.0 {
            proposals as f64 / (window_seconds / 3600.0)
        } else {
            0.0
        },
        apply_success_rate: rate(apply_ok, apply_fail),
        verify_success_rate: rate(verify_ok, verify_fail),
        queue_depth_p95: percentile(&depth_f, 95.0),
        queue_depth_max: queue_depths.iter().max().copied(),
        cycle_latency_s_p50: percentile(&latencies, 50.0),
        cycle_latency_s_p95: percentile(&latencies, 95.0),
        last_cycle,
    }
}

fn read_events(path: &Path) -> Vec<Value> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn rate(ok: usize, fail: usize) -> Option<f64> {
    let total = ok + fail;
    (total > 0).then(|| ok as f64 / total as f64)
}

/// Nearest-rank percentile over an unsorted sample; `None` when empty.
fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted.get(idx.min(sorted.len() - 1)).copied()
}
