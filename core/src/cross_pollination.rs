//! Deterministic multi-round proposal coordination.
//!
//! Reduces many (possibly overlapping) proposals to a disjoint, ordered set:
//! flatten refined lists, dedupe, cluster by file overlap, pick one winner
//! per cluster by score, sort. Every comparison has a total order (ties
//! break on |loc|, then agent, then title), so the output is reproducible
//! for tests and telemetry.

use std::collections::BTreeSet;
use std::collections::HashSet;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::protocol::Proposal;
use crate::protocol::RiskLevel;

#[derive(Debug, Clone, Serialize)]
pub struct CrossPollinationOutcome {
    pub proposals: Vec<Proposal>,
    pub round1_count: usize,
    pub deduped_count: usize,
    pub cluster_count: usize,
    pub final_count: usize,
}

/// Run the full reduction over the base proposals and the per-agent refined
/// lists.
pub fn cross_pollinate(
    base_proposals: &[Proposal],
    refined_lists: &[Vec<Proposal>],
) -> CrossPollinationOutcome {
    // Round 1: flatten the refined lists; fall back to base when every agent
    // declined to refine.
    let mut round1: Vec<Proposal> = refined_lists.iter().flatten().cloned().collect();
    if round1.is_empty() {
        round1 = base_proposals.to_vec();
    }
    let round1_count = round1.len();

    let round2 = dedupe(round1);
    let deduped_count = round2.len();

    let clusters = conflict_clusters(&round2);
    let cluster_count = clusters.len();

    let mut winners: Vec<Proposal> = clusters
        .into_iter()
        .map(|cluster| select_winner(cluster))
        .collect();

    winners.sort_by(|a, b| {
        proposal_score(b)
            .cmp(&proposal_score(a))
            .then_with(|| a.agent.to_lowercase().cmp(&b.agent.to_lowercase()))
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });

    let final_count = winners.len();
    CrossPollinationOutcome {
        proposals: winners,
        round1_count,
        deduped_count,
        cluster_count,
        final_count,
    }
}

/// Round 2: keep the first occurrence per
/// (agent-lower, title-trimmed-lower, sorted files, sha256(diff)) key.
fn dedupe(proposals: Vec<Proposal>) -> Vec<Proposal> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(proposals.len());
    for proposal in proposals {
        let digest = Sha256::digest(proposal.diff.as_bytes());
        let mut files: Vec<&str> = proposal.files_touched.iter().map(String::as_str).collect();
        files.sort_unstable();
        let key = format!(
            "{}|{}|{}|{digest:x}",
            proposal.agent.to_lowercase(),
            proposal.title.trim().to_lowercase(),
            files.join(","),
        );
        if seen.insert(key) {
            out.push(proposal);
        }
    }
    out
}

/// Round 3: connected components of the "touches an overlapping file" graph.
fn conflict_clusters(proposals: &[Proposal]) -> Vec<Vec<Proposal>> {
    if proposals.is_empty() {
        return Vec::new();
    }
    let n = proposals.len();
    let file_sets: Vec<BTreeSet<&str>> = proposals
        .iter()
        .map(|p| p.files_touched.iter().map(String::as_str).collect())
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in i + 1..n {
            if !file_sets[i].is_disjoint(&file_sets[j]) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }

    let mut seen = vec![false; n];
    let mut clusters = Vec::new();
    for start in 0..n {
        if seen[start] {
            continue;
        }
        let mut stack = vec![start];
        let mut component = Vec::new();
        seen[start] = true;
        while let Some(current) = stack.pop() {
            component.push(current);
            for &next in &adjacency[current] {
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        component.sort_unstable();
        clusters.push(component.into_iter().map(|i| proposals[i].clone()).collect());
    }
    clusters
}

/// Round 4: highest score wins; ties break by smaller |loc_change|, then
/// lexicographic (agent, title).
fn select_winner(mut cluster: Vec<Proposal>) -> Proposal {
    if cluster.len() == 1 {
        return cluster.remove(0);
    }
    cluster.sort_by(|a, b| {
        proposal_score(b)
            .cmp(&proposal_score(a))
            .then_with(|| a.estimated_loc_change.abs().cmp(&b.estimated_loc_change.abs()))
            .then_with(|| a.agent.to_lowercase().cmp(&b.agent.to_lowercase()))
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });
    cluster.remove(0)
}

fn risk_weight(level: RiskLevel) -> i64 {
    match level {
        RiskLevel::Critical => 40,
        RiskLevel::High => 30,
        RiskLevel::Medium => 20,
        RiskLevel::Low => 10,
    }
}

fn tag_bonus(tag: &str) -> i64 {
    match tag.to_lowercase().as_str() {
        "security" => 6,
        "auth" => 5,
        "test" => 4,
        "performance" => 4,
        "refactor" => 3,
        "style" => 1,
        _ => 0,
    }
}

/// `risk_weight + Σ tag_bonus − min(|loc|, 500)/25`.
pub fn proposal_score(proposal: &Proposal) -> i64 {
    let tag_score: i64 = proposal.tags.iter().map(|t| tag_bonus(t)).sum();
    let size_penalty = proposal.estimated_loc_change.abs().min(500) / 25;
    risk_weight(proposal.risk_level) + tag_score - size_penalty
}
