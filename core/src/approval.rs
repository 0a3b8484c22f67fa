//! Approval flow for gated proposals.
//!
//! Four variants behind one trait: an interactive TTY prompt, constant
//! approve/reject handlers, and a synchronous webhook. The webhook is
//! fail-closed: any transport error, non-200, parse failure, or unrecognized
//! `approved` value denies the proposal.

use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracing::warn;

use crate::config::WebhookApprovalConfig;
use crate::protocol::Proposal;
use crate::risk::RiskAssessment;
use crate::risk::generate_risk_report;
use crate::util::now_epoch;

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, proposal: &Proposal, assessment: &RiskAssessment) -> bool;

    /// True for the always-reject variant: the coordinator treats it as
    /// dry-run mode and never touches the repository.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Prints a risk report and diff preview, then loops on
/// `[y/N/d(iff)/q(uit)]`. "q" terminates the process.
pub struct InteractiveApprovalHandler;

const DIFF_PREVIEW_LINES: usize = 50;

#[async_trait]
impl ApprovalHandler for InteractiveApprovalHandler {
    async fn request_approval(&self, proposal: &Proposal, assessment: &RiskAssessment) -> bool {
        let proposal = proposal.clone();
        let report = generate_risk_report(&proposal, assessment);
        // Blocking stdin; keep it off the coordinator's reactor threads.
        let decision = tokio::task::spawn_blocking(move || prompt_loop(&proposal, &report)).await;
        decision.unwrap_or(false)
    }
}

fn prompt_loop(proposal: &Proposal, report: &str) -> bool {
    println!("\n{}", "=".repeat(60));
    println!("APPROVAL REQUIRED");
    println!("{}", "=".repeat(60));
    println!("\n{report}");
    println!("Proposal Details:");
    println!("  Title: {}", proposal.title);
    println!("  Description: {}", proposal.description);
    println!("  Rationale: {}", proposal.rationale);
    println!("\nFiles to be modified:");
    for path in &proposal.files_touched {
        println!("  - {path}");
    }
    println!();

    let diff_lines: Vec<&str> = proposal.diff.lines().collect();
    if diff_lines.len() > DIFF_PREVIEW_LINES {
        println!("Diff (first {DIFF_PREVIEW_LINES} lines):");
        println!("{}", diff_lines[..DIFF_PREVIEW_LINES].join("\n"));
        println!("  ... ({} more lines)", diff_lines.len() - DIFF_PREVIEW_LINES);
    } else {
        println!("Diff:");
        println!("{}", proposal.diff);
    }
    println!();

    loop {
        print!("Approve this change? [y/N/d(iff)/q(uit)]: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => {
                println!("Approved");
                return true;
            }
            "n" | "no" | "" => {
                println!("Rejected");
                return false;
            }
            "d" | "diff" => {
                println!("\nFull diff:\n{}\n", proposal.diff);
            }
            "q" | "quit" => {
                println!("Exiting approval process");
                std::process::exit(0);
            }
            _ => println!("Invalid response. Please enter y(es), n(o), d(iff), or q(uit)."),
        }
    }
}

/// Always approves. For CI and tests.
pub struct AlwaysApproveHandler;

#[async_trait]
impl ApprovalHandler for AlwaysApproveHandler {
    async fn request_approval(&self, _proposal: &Proposal, _assessment: &RiskAssessment) -> bool {
        true
    }
}

/// Always rejects; marks the coordinator as dry-run.
pub struct AlwaysRejectHandler;

#[async_trait]
impl ApprovalHandler for AlwaysRejectHandler {
    async fn request_approval(&self, _proposal: &Proposal, _assessment: &RiskAssessment) -> bool {
        false
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// POSTs the proposal and assessment to an external endpoint and interprets
/// its `approved` field.
pub struct WebhookApprovalHandler {
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookApprovalHandler {
    pub fn new(url: String, config: &WebhookApprovalConfig) -> Self {
        Self {
            url,
            headers: config.headers.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &WebhookApprovalConfig) -> Option<Self> {
        config.url.clone().map(|url| Self::new(url, config))
    }
}

#[async_trait]
impl ApprovalHandler for WebhookApprovalHandler {
    async fn request_approval(&self, proposal: &Proposal, assessment: &RiskAssessment) -> bool {
        let payload = json!({
            "timestamp": now_epoch(),
            "proposal": proposal,
            "assessment": assessment,
        });

        let mut request = self.client.post(&self.url).timeout(self.timeout);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = match request.json(&payload).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!("approval webhook failed, denying: {err}");
                return false;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            return false;
        }
        let Ok(body) = response.json::<Value>().await else {
            return false;
        };
        interpret_approved(body.get("approved").unwrap_or(&Value::Null))
    }
}

/// Interpret a webhook's `approved` field. Booleans, well-known string
/// literals, and integer 1/0 are understood; everything else denies.
fn interpret_approved(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "y" | "approve" | "approved"
        ),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}
