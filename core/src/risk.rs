//! Risk assessment and policy enforcement for proposals.
//!
//! Decides whether a proposal needs human approval based on its risk level,
//! scope (files and LOC), touched paths, and tags.

use std::fmt::Write as _;

use serde::Serialize;

use crate::config::RiskPolicyConfig;
use crate::protocol::Proposal;

/// Path fragments that always raise a risk factor, matched
/// case-insensitively against every touched path.
pub const SENSITIVE_FILE_PATTERNS: [&str; 11] = [
    ".env",
    "secret",
    "password",
    "credentials",
    "api_key",
    "private_key",
    "auth",
    "payment",
    "billing",
    "database",
    "config/production",
];

const HIGH_RISK_TAGS: [&str; 6] = [
    "security",
    "auth",
    "authentication",
    "payment",
    "billing",
    "database",
];

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub requires_approval: bool,
    pub risk_factors: Vec<String>,
    pub auto_apply_eligible: bool,
    pub risk_score: usize,
}

/// Assess a proposal against policy.
///
/// Invariants: `requires_approval ⇔ risk_factors is non-empty`, and
/// `auto_apply_eligible ⇒ ¬requires_approval`. Limits are strict
/// inequalities: exactly at the limit does not raise a factor.
pub fn assess_risk(proposal: &Proposal, policy: &RiskPolicyConfig) -> RiskAssessment {
    let mut risk_factors: Vec<String> = Vec::new();

    if policy.require_approval.contains(&proposal.risk_level) {
        risk_factors.push(format!("Risk level: {}", proposal.risk_level));
    }

    if proposal.files_touched.len() > policy.file_change_limit {
        risk_factors.push(format!(
            "Too many files: {} > {}",
            proposal.files_touched.len(),
            policy.file_change_limit
        ));
    }

    if proposal.estimated_loc_change.abs() > policy.loc_change_limit {
        risk_factors.push(format!(
            "Large change: {} LOC > {}",
            proposal.estimated_loc_change.abs(),
            policy.loc_change_limit
        ));
    }

    let sensitive: Vec<&str> = proposal
        .files_touched
        .iter()
        .filter(|path| {
            let lower = path.to_lowercase();
            SENSITIVE_FILE_PATTERNS
                .iter()
                .any(|pattern| lower.contains(pattern))
        })
        .map(String::as_str)
        .collect();
    if !sensitive.is_empty() {
        risk_factors.push(format!("Sensitive files: {}", sensitive.join(", ")));
    }

    let risky_tags: Vec<&str> = proposal
        .tags
        .iter()
        .filter(|tag| HIGH_RISK_TAGS.contains(&tag.to_lowercase().as_str()))
        .map(String::as_str)
        .collect();
    if !risky_tags.is_empty() {
        risk_factors.push(format!("High-risk tags: {}", risky_tags.join(", ")));
    }

    let requires_approval = !risk_factors.is_empty();
    let auto_apply_eligible =
        !requires_approval && policy.auto_apply.contains(&proposal.risk_level);
    let risk_score = risk_factors.len();

    RiskAssessment {
        requires_approval,
        risk_factors,
        auto_apply_eligible,
        risk_score,
    }
}

/// Sort highest risk first (critical, high, medium, low): apply the most
/// urgent fixes before anything else can fail the cycle.
pub fn sort_by_risk_priority(mut proposals: Vec<Proposal>) -> Vec<Proposal> {
    proposals.sort_by_key(|p| p.risk_level);
    proposals
}

/// Human-readable report shown by the interactive approval prompt.
pub fn generate_risk_report(proposal: &Proposal, assessment: &RiskAssessment) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Risk Assessment: {}", proposal.title);
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Agent: {}", proposal.agent);
    let _ = writeln!(out, "Risk Level: {}", proposal.risk_level);
    let _ = writeln!(out, "Files Touched: {}", proposal.files_touched.len());
    let _ = writeln!(
        out,
        "Estimated LOC Change: {:+}",
        proposal.estimated_loc_change
    );
    out.push('\n');

    if assessment.risk_factors.is_empty() {
        let _ = writeln!(out, "No risk factors identified.");
    } else {
        let _ = writeln!(out, "Risk Factors:");
        for factor in &assessment.risk_factors {
            let _ = writeln!(out, "  - {factor}");
        }
    }

    out.push('\n');
    let _ = writeln!(out, "Requires Approval: {}", assessment.requires_approval);
    let _ = writeln!(
        out,
        "Auto-Apply Eligible: {}",
        assessment.auto_apply_eligible
    );
    let _ = writeln!(out, "Risk Score: {}", assessment.risk_score);
    out
}
