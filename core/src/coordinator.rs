//! The scheduler.
//!
//! Owns all run state: the bounded event queue, the single-writer lock, the
//! rolling proposal-rate window, the apply/verify outcome rings, and the
//! exponential-backoff scalars. One cycle runs from event intake to
//! post-application telemetry; errors below the cycle level are converted to
//! structured results, cycle-level errors feed the control-plane backoff,
//! and the supervisor itself only exits on SIGINT/SIGTERM.

use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use futures::StreamExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use strum_macros::Display;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::agents::SpecialistAgent;
use crate::agents::build_agents;
use crate::approval::ApprovalHandler;
use crate::config::AmbientConfig;
use crate::cross_pollination::cross_pollinate;
use crate::error::Result;
use crate::git;
use crate::model_client::ModelClient;
use crate::patch_engine;
use crate::protocol::AmbientEvent;
use crate::protocol::Proposal;
use crate::protocol::RepoContext;
use crate::protocol::ReviewCandidate;
use crate::protocol::VerificationResult;
use crate::redaction::DEFAULT_REDACT_LEN;
use crate::redaction::redact_text;
use crate::risk::assess_risk;
use crate::risk::sort_by_risk_priority;
use crate::telemetry::TelemetrySink;
use crate::util::short_run_id;
use crate::watcher::spawn_watcher;
use crate::workspace::Workspace;
use crate::worktrees::ReviewWorktreeManager;

/// Rolling window for the proposals-per-hour throttle.
const THROTTLE_WINDOW: Duration = Duration::from_secs(3600);
/// Queue poll timeout inside the main loop; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CycleStatus {
    Success,
    NoProposals,
    Paused,
    Throttled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    Throttled,
    DryRun,
    DirtyWorktree,
    ApprovalRejected,
    PatchFailed,
    VerificationFailed,
    GitCommitFailed,
    AutoApplyDisabled,
    WorktreeFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedProposal {
    pub proposal: Proposal,
    pub stat: String,
    pub verification: Option<VerificationResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedProposal {
    pub proposal: Proposal,
    pub reason: FailureReason,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub run_id: String,
    pub status: CycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub proposals: Vec<Proposal>,
    pub applied: Vec<AppliedProposal>,
    pub failed: Vec<FailedProposal>,
    pub review_candidates: Vec<ReviewCandidate>,
}

impl CycleOutcome {
    fn empty(run_id: String, status: CycleStatus) -> Self {
        Self {
            run_id,
            status,
            error: None,
            proposals: Vec::new(),
            applied: Vec::new(),
            failed: Vec::new(),
            review_candidates: Vec::new(),
        }
    }
}

pub struct Coordinator {
    repo_path: PathBuf,
    config: AmbientConfig,
    workspace: Workspace,
    telemetry: Arc<TelemetrySink>,
    agents: Vec<Box<dyn SpecialistAgent>>,
    approval: Box<dyn ApprovalHandler>,
    events_tx: async_channel::Sender<AmbientEvent>,
    events_rx: async_channel::Receiver<AmbientEvent>,
    write_lock: Arc<Mutex<()>>,
    proposal_timestamps: VecDeque<Instant>,
    apply_outcomes: VecDeque<bool>,
    verify_outcomes: VecDeque<bool>,
    backoff_seconds: u64,
    backoff_until: Option<Instant>,
    running: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(repo_path: &Path, config: AmbientConfig, approval: Box<dyn ApprovalHandler>) -> Self {
        let workspace = Workspace::new(repo_path, &config);
        let telemetry = Arc::new(TelemetrySink::new(repo_path, &config.telemetry));
        let client = Arc::new(ModelClient::new(config.model.clone()));
        let agents = build_agents(&config.agents.enabled, &client);
        let (events_tx, events_rx) = async_channel::bounded(config.monitoring.max_queue_size.max(1));

        Self {
            repo_path: repo_path.to_path_buf(),
            config,
            workspace,
            telemetry,
            agents,
            approval,
            events_tx,
            events_rx,
            write_lock: Arc::new(Mutex::new(())),
            proposal_timestamps: VecDeque::new(),
            apply_outcomes: VecDeque::new(),
            verify_outcomes: VecDeque::new(),
            backoff_seconds: 0,
            backoff_until: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Swap in a different agent set. Used by embedders and tests that
    /// script agent behavior instead of calling a model endpoint.
    pub fn replace_agents(&mut self, agents: Vec<Box<dyn SpecialistAgent>>) {
        self.agents = agents;
    }

    /// Producer handle for one-shot event injection (CLI `run-once` with an
    /// explicit event, debug tooling).
    pub fn events_sender(&self) -> async_channel::Sender<AmbientEvent> {
        self.events_tx.clone()
    }

    pub fn telemetry(&self) -> Arc<TelemetrySink> {
        Arc::clone(&self.telemetry)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Flip the lifecycle flag; the main loop exits on its next iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Supervise: watcher + periodic tick + main event loop, until a signal
    /// or `stop()` flips the lifecycle flag.
    pub async fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.install_signal_handlers();
        self.telemetry.prune_if_stale();

        let _watcher = if self.config.monitoring.enabled {
            Some(spawn_watcher(
                &self.repo_path,
                &self.config.monitoring,
                self.events_tx.clone(),
                Arc::clone(&self.telemetry),
            )?)
        } else {
            None
        };

        let tick = tokio::spawn(periodic_tick(
            self.events_tx.clone(),
            self.config.monitoring.check_interval_seconds,
        ));

        info!("ambient coordinator watching {}", self.repo_path.display());
        while self.running.load(Ordering::SeqCst) {
            if let Some(until) = self.backoff_until {
                let now = Instant::now();
                if now < until {
                    // Sleep in short slices so a signal still stops us.
                    let remaining = until - now;
                    tokio::time::sleep(remaining.min(POLL_TIMEOUT)).await;
                    continue;
                }
                self.backoff_until = None;
            }

            match timeout(POLL_TIMEOUT, self.events_rx.recv()).await {
                Ok(Ok(event)) => {
                    self.handle_event(event).await;
                }
                Ok(Err(_closed)) => break,
                Err(_elapsed) => continue,
            }
        }

        tick.abort();
        info!("ambient coordinator stopped");
        Ok(())
    }

    /// Run a single cycle without starting the watcher.
    pub async fn run_once(&mut self, event: Option<AmbientEvent>) -> CycleOutcome {
        let event = event.unwrap_or_else(AmbientEvent::periodic_scan);
        self.handle_event(event).await
    }

    fn install_signal_handlers(&self) {
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                info!("interrupt received, shutting down");
                running.store(false, Ordering::SeqCst);
            }
        });

        #[cfg(unix)]
        {
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                use tokio::signal::unix::SignalKind;
                use tokio::signal::unix::signal;
                let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                    return;
                };
                loop {
                    sigterm.recv().await;
                    info!("SIGTERM received, shutting down");
                    running.store(false, Ordering::SeqCst);
                }
            });
        }
    }

    /// One full cycle. Cycle-level errors are recovered here: they update
    /// the backoff state and surface as an `error` outcome, never a panic of
    /// the supervisor.
    pub async fn handle_event(&mut self, event: AmbientEvent) -> CycleOutcome {
        let run_id = short_run_id();
        self.telemetry.prune_if_stale();
        self.telemetry.log(
            &run_id,
            "cycle_started",
            json!({
                "event_type": event.kind,
                "event_data": event.data,
                "queue_depth": self.events_rx.len(),
            }),
        );

        if self.config.control_plane.paused {
            self.telemetry
                .log(&run_id, "cycle_completed", json!({"status": "paused"}));
            return CycleOutcome::empty(run_id, CycleStatus::Paused);
        }

        match self.run_cycle(&run_id, &event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.bump_backoff();
                let redacted = redact_text(&err.to_string(), DEFAULT_REDACT_LEN);
                error!("cycle {run_id} failed: {redacted}");
                self.telemetry.log(
                    &run_id,
                    "cycle_completed",
                    json!({"status": "error", "error": redacted}),
                );
                let mut outcome = CycleOutcome::empty(run_id, CycleStatus::Error);
                outcome.error = Some(redacted);
                outcome
            }
        }
    }

    async fn run_cycle(&mut self, run_id: &str, event: &AmbientEvent) -> Result<CycleOutcome> {
        let context = self.workspace.build_context(event).await?;

        let proposals = self.generate_proposals(run_id, &context).await;
        if proposals.is_empty() {
            self.telemetry.log(
                run_id,
                "cycle_completed",
                json!({"status": "no_proposals", "proposals_count": 0}),
            );
            return Ok(CycleOutcome::empty(run_id.to_string(), CycleStatus::NoProposals));
        }

        // Throttle on the rolling one-hour window before spending any more
        // model calls or repo mutations on this batch.
        let now = Instant::now();
        for _ in 0..proposals.len() {
            self.proposal_timestamps.push_back(now);
        }
        while let Some(&oldest) = self.proposal_timestamps.front() {
            if now.duration_since(oldest) > THROTTLE_WINDOW {
                self.proposal_timestamps.pop_front();
            } else {
                break;
            }
        }
        let max_per_hour = self.config.control_plane.max_proposals_per_hour;
        if max_per_hour > 0 && self.proposal_timestamps.len() > max_per_hour {
            warn!(
                "throttled: {} proposals in the last hour (max {max_per_hour})",
                self.proposal_timestamps.len()
            );
            self.telemetry.log(
                run_id,
                "control_plane_throttled",
                json!({
                    "window_size": self.proposal_timestamps.len(),
                    "max_proposals_per_hour": max_per_hour,
                }),
            );
            let failed = proposals
                .into_iter()
                .map(|proposal| FailedProposal {
                    proposal,
                    reason: FailureReason::Throttled,
                    details: "proposal rate limit exceeded".to_string(),
                })
                .collect::<Vec<_>>();
            self.telemetry.log(
                run_id,
                "cycle_completed",
                json!({"status": "throttled", "failed_count": failed.len()}),
            );
            let mut outcome = CycleOutcome::empty(run_id.to_string(), CycleStatus::Throttled);
            outcome.failed = failed;
            return Ok(outcome);
        }

        let refined_lists = self.refine_proposals(&proposals, &context).await;
        let pollinated = cross_pollinate(&proposals, &refined_lists);
        self.telemetry.log(
            run_id,
            "cross_pollination",
            json!({
                "original_count": proposals.len(),
                "refined_count": pollinated.round1_count,
                "deduped_count": pollinated.deduped_count,
                "conflict_cluster_count": pollinated.cluster_count,
                "final_count": pollinated.final_count,
            }),
        );

        let sorted = sort_by_risk_priority(pollinated.proposals);

        let (applied, failed, review_candidates) = if self.config.review_worktree.enabled {
            self.apply_review_mode(run_id, sorted.clone()).await?
        } else {
            let (applied, failed) = self.apply_direct_mode(run_id, sorted.clone()).await?;
            (applied, failed, Vec::new())
        };

        self.telemetry.log(
            run_id,
            "cycle_completed",
            json!({
                "status": "success",
                "proposals_count": sorted.len(),
                "applied_count": applied.len(),
                "failed_count": failed.len(),
            }),
        );

        Ok(CycleOutcome {
            run_id: run_id.to_string(),
            status: CycleStatus::Success,
            error: None,
            proposals: sorted,
            applied,
            failed,
            review_candidates,
        })
    }

    /// Fan out `propose` to every agent in parallel. An agent error is
    /// logged and contributes nothing; it never fails the cycle.
    async fn generate_proposals(&self, run_id: &str, context: &RepoContext) -> Vec<Proposal> {
        if self.agents.is_empty() {
            return Vec::new();
        }

        let results = join_all(self.agents.iter().map(|agent| agent.propose(context))).await;

        let mut proposals = Vec::new();
        for (agent, result) in self.agents.iter().zip(results) {
            match result {
                Ok(list) => {
                    for proposal in &list {
                        self.telemetry
                            .log(run_id, "proposal", self.telemetry.proposal_data(proposal));
                    }
                    proposals.extend(list);
                }
                Err(err) => {
                    warn!("agent {} failed: {err}", agent.name());
                    self.telemetry.log(
                        run_id,
                        "agent_error",
                        json!({
                            "agent": agent.name(),
                            "error": redact_text(&err.to_string(), DEFAULT_REDACT_LEN),
                        }),
                    );
                }
            }
        }
        proposals
    }

    async fn refine_proposals(
        &self,
        proposals: &[Proposal],
        context: &RepoContext,
    ) -> Vec<Vec<Proposal>> {
        let results = join_all(
            self.agents
                .iter()
                .map(|agent| agent.refine(proposals, context)),
        )
        .await;
        results
            .into_iter()
            .map(|result| result.unwrap_or_default())
            .collect()
    }

    /// Direct mode: serial application onto the main worktree, one proposal
    /// at a time under the write lock.
    async fn apply_direct_mode(
        &mut self,
        run_id: &str,
        proposals: Vec<Proposal>,
    ) -> Result<(Vec<AppliedProposal>, Vec<FailedProposal>)> {
        let mut applied: Vec<AppliedProposal> = Vec::new();
        let mut failed: Vec<FailedProposal> = Vec::new();

        if self.approval.is_dry_run() {
            for proposal in proposals {
                self.telemetry.log(
                    run_id,
                    "dry_run_skip",
                    json!({"proposal_title": proposal.title}),
                );
                failed.push(FailedProposal {
                    proposal,
                    reason: FailureReason::DryRun,
                    details: "skipped in dry-run mode".to_string(),
                });
            }
            return Ok((applied, failed));
        }

        let write_lock = Arc::clone(&self.write_lock);
        let mut remaining = proposals.into_iter();

        while let Some(proposal) = remaining.next() {
            // Kill-switch: once the recent apply+verify tail is failing too
            // often, stop auto-applying for this cycle entirely.
            if self.auto_apply_disabled() {
                self.telemetry.log(
                    run_id,
                    "control_plane_auto_apply_disabled",
                    json!({
                        "failure_rate_threshold": self.config.control_plane.failure_rate_threshold,
                    }),
                );
                for proposal in std::iter::once(proposal).chain(remaining) {
                    failed.push(FailedProposal {
                        proposal,
                        reason: FailureReason::AutoApplyDisabled,
                        details: "auto-apply disabled by failure-rate kill-switch".to_string(),
                    });
                }
                break;
            }

            if self.config.git.require_clean_before_apply {
                let ignored: Vec<String> = git::DEFAULT_IGNORED_UNTRACKED_PREFIXES
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                if !git::is_clean(&self.repo_path, &ignored).await? {
                    failed.push(FailedProposal {
                        proposal,
                        reason: FailureReason::DirtyWorktree,
                        details: "worktree has uncommitted changes".to_string(),
                    });
                    continue;
                }
            }

            if !self.pass_risk_gate(run_id, &proposal).await {
                failed.push(FailedProposal {
                    proposal,
                    reason: FailureReason::ApprovalRejected,
                    details: "approval was not granted".to_string(),
                });
                continue;
            }

            let _guard = write_lock.lock().await;

            let apply_result = self.workspace.apply_patch(&proposal).await;
            if !apply_result.ok {
                push_ring(
                    &mut self.apply_outcomes,
                    false,
                    self.config.control_plane.failure_rate_window,
                );
                self.bump_backoff();
                self.telemetry.log(
                    run_id,
                    "apply_failed",
                    json!({
                        "proposal_title": proposal.title,
                        "stderr_head": redact_text(&apply_result.stderr, DEFAULT_REDACT_LEN),
                    }),
                );
                failed.push(FailedProposal {
                    proposal,
                    reason: FailureReason::PatchFailed,
                    details: apply_result.stderr,
                });
                continue;
            }
            push_ring(
                &mut self.apply_outcomes,
                true,
                self.config.control_plane.failure_rate_window,
            );
            self.telemetry.log(
                run_id,
                "apply_succeeded",
                json!({
                    "proposal_title": proposal.title,
                    "stat": apply_result.stat,
                    "status": apply_result.status,
                }),
            );

            let verification = self.workspace.verify_changes().await;
            if !verification.ok {
                self.workspace.rollback().await;
                push_ring(
                    &mut self.verify_outcomes,
                    false,
                    self.config.control_plane.failure_rate_window,
                );
                self.bump_backoff();
                self.telemetry.log(
                    run_id,
                    "verify_failed",
                    json!({
                        "proposal_title": proposal.title,
                        "results": verification_summaries(&verification),
                    }),
                );
                failed.push(FailedProposal {
                    proposal,
                    reason: FailureReason::VerificationFailed,
                    details: serde_json::to_string(&verification_summaries(&verification))
                        .unwrap_or_default(),
                });
                continue;
            }
            push_ring(
                &mut self.verify_outcomes,
                true,
                self.config.control_plane.failure_rate_window,
            );
            self.telemetry.log(
                run_id,
                "verify_succeeded",
                json!({
                    "proposal_title": proposal.title,
                    "duration_s": verification.duration_s,
                }),
            );

            if self.config.git.commit_on_success {
                self.telemetry.log(
                    run_id,
                    "git_commit_started",
                    json!({"proposal_title": proposal.title}),
                );
                let message = commit_message(&self.config, run_id, &proposal);
                let commit_result = git::commit(
                    &self.repo_path,
                    &message,
                    &self.config.git.commit_author_name,
                    &self.config.git.commit_author_email,
                )
                .await;
                if let Err(err) = commit_result {
                    self.workspace.rollback().await;
                    self.telemetry.log(
                        run_id,
                        "git_commit_failed",
                        json!({
                            "proposal_title": proposal.title,
                            "error": redact_text(&err.to_string(), DEFAULT_REDACT_LEN),
                        }),
                    );
                    failed.push(FailedProposal {
                        proposal,
                        reason: FailureReason::GitCommitFailed,
                        details: err.to_string(),
                    });
                    continue;
                }
                self.telemetry.log(
                    run_id,
                    "git_commit_succeeded",
                    json!({"proposal_title": proposal.title}),
                );
            }

            // First fully successful application resets the backoff.
            self.backoff_seconds = 0;
            self.backoff_until = None;

            applied.push(AppliedProposal {
                proposal,
                stat: apply_result.stat,
                verification: Some(verification),
            });
        }

        Ok((applied, failed))
    }

    /// Review-worktree mode: gate everything up-front, then apply each
    /// approved proposal in its own worktree with bounded parallelism. No
    /// global lock; distinct worktrees are independent writers.
    async fn apply_review_mode(
        &mut self,
        run_id: &str,
        proposals: Vec<Proposal>,
    ) -> Result<(Vec<AppliedProposal>, Vec<FailedProposal>, Vec<ReviewCandidate>)> {
        let review_config = self.config.review_worktree.clone();
        let manager = ReviewWorktreeManager::new(
            &self.repo_path,
            &review_config.base_dir,
            &review_config.branch_prefix,
        );

        let mut queue: Vec<(Proposal, ReviewCandidate)> = Vec::new();
        let mut failed: Vec<FailedProposal> = Vec::new();
        let mut candidates: Vec<ReviewCandidate> = Vec::new();
        let mut index = 0usize;

        for proposal in proposals {
            if !self.pass_risk_gate(run_id, &proposal).await {
                failed.push(FailedProposal {
                    proposal,
                    reason: FailureReason::ApprovalRejected,
                    details: "approval was not granted".to_string(),
                });
                continue;
            }
            index += 1;
            match manager.create_candidate(run_id, index, &proposal.title).await {
                Ok(candidate) => {
                    candidates.push(candidate.clone());
                    queue.push((proposal, candidate));
                }
                Err(err) => {
                    self.telemetry.log(
                        run_id,
                        "review_candidate_failed",
                        json!({
                            "proposal_title": proposal.title,
                            "error": redact_text(&err.to_string(), DEFAULT_REDACT_LEN),
                        }),
                    );
                    failed.push(FailedProposal {
                        proposal,
                        reason: FailureReason::WorktreeFailed,
                        details: err.to_string(),
                    });
                }
            }
        }

        let max_parallel = review_config.max_parallel.max(1);
        let workspace = &self.workspace;
        let config = &self.config;
        let telemetry = Arc::clone(&self.telemetry);
        let results: Vec<CandidateOutcome> = futures::stream::iter(
            queue
                .into_iter()
                .map(|(proposal, candidate)| {
                    let telemetry = Arc::clone(&telemetry);
                    async move {
                        process_candidate(
                            workspace,
                            config,
                            telemetry.as_ref(),
                            run_id,
                            proposal,
                            candidate,
                        )
                        .await
                    }
                }),
        )
        .buffer_unordered(max_parallel)
        .collect()
        .await;

        let mut applied: Vec<AppliedProposal> = Vec::new();
        for outcome in results {
            match outcome {
                CandidateOutcome::Applied(result) => applied.push(result),
                CandidateOutcome::Failed(failure) => failed.push(failure),
            }
        }

        if !review_config.keep_worktrees {
            for candidate in &candidates {
                manager.remove_candidate(candidate).await;
            }
        }

        Ok((applied, failed, candidates))
    }

    /// Risk gate: evaluate, and when approval is required, consult the
    /// handler. True means the proposal may proceed.
    async fn pass_risk_gate(&self, run_id: &str, proposal: &Proposal) -> bool {
        let assessment = assess_risk(proposal, &self.config.risk_policy);
        if !assessment.requires_approval {
            return true;
        }

        self.telemetry.log(
            run_id,
            "risk_gate_triggered",
            json!({
                "proposal_title": proposal.title,
                "risk_level": proposal.risk_level,
                "risk_factors": assessment.risk_factors,
                "risk_score": assessment.risk_score,
            }),
        );

        if self.approval.request_approval(proposal, &assessment).await {
            self.telemetry.log(
                run_id,
                "approval_granted",
                json!({"proposal_title": proposal.title}),
            );
            true
        } else {
            self.telemetry.log(
                run_id,
                "approval_rejected",
                json!({"proposal_title": proposal.title}),
            );
            false
        }
    }

    /// Combined tail of apply+verify outcomes breaching both the minimum
    /// failure count and the failure-rate threshold.
    fn auto_apply_disabled(&self) -> bool {
        let control = &self.config.control_plane;
        if !control.disable_auto_apply_on_failure_rate {
            return false;
        }
        let total = self.apply_outcomes.len() + self.verify_outcomes.len();
        if total == 0 {
            return false;
        }
        let failures = self
            .apply_outcomes
            .iter()
            .chain(self.verify_outcomes.iter())
            .filter(|&&ok| !ok)
            .count();
        failures >= control.min_failures_before_disable
            && (failures as f64 / total as f64) > control.failure_rate_threshold
    }

    /// next = min(max, max(base, prev*2)); reset to zero on success.
    fn bump_backoff(&mut self) {
        let control = &self.config.control_plane;
        let doubled = self.backoff_seconds.saturating_mul(2);
        let next = doubled
            .max(control.backoff_base_seconds)
            .min(control.backoff_max_seconds);
        self.backoff_seconds = next;
        self.backoff_until = Some(Instant::now() + Duration::from_secs(next));
        warn!("control plane backoff: {next}s");
    }

    pub fn backoff_seconds(&self) -> u64 {
        self.backoff_seconds
    }
}

enum CandidateOutcome {
    Applied(AppliedProposal),
    Failed(FailedProposal),
}

/// Review-mode worker: apply, verify, and emit the patch artifact inside one
/// candidate's worktree.
async fn process_candidate(
    workspace: &Workspace,
    config: &AmbientConfig,
    telemetry: &TelemetrySink,
    run_id: &str,
    proposal: Proposal,
    candidate: ReviewCandidate,
) -> CandidateOutcome {
    let apply_result =
        patch_engine::apply_patch_atomic(&candidate.worktree_path, &proposal.diff).await;
    if !apply_result.ok {
        telemetry.log(
            run_id,
            "apply_failed",
            json!({
                "proposal_title": proposal.title,
                "branch": candidate.branch,
                "stderr_head": redact_text(&apply_result.stderr, DEFAULT_REDACT_LEN),
            }),
        );
        return CandidateOutcome::Failed(FailedProposal {
            proposal,
            reason: FailureReason::PatchFailed,
            details: apply_result.stderr,
        });
    }
    telemetry.log(
        run_id,
        "apply_succeeded",
        json!({
            "proposal_title": proposal.title,
            "branch": candidate.branch,
            "stat": apply_result.stat,
        }),
    );

    let verification = workspace.verify_at(&candidate.worktree_path).await;
    if !verification.ok {
        telemetry.log(
            run_id,
            "verify_failed",
            json!({
                "proposal_title": proposal.title,
                "branch": candidate.branch,
                "results": verification_summaries(&verification),
            }),
        );
        return CandidateOutcome::Failed(FailedProposal {
            proposal,
            reason: FailureReason::VerificationFailed,
            details: serde_json::to_string(&verification_summaries(&verification))
                .unwrap_or_default(),
        });
    }
    telemetry.log(
        run_id,
        "verify_succeeded",
        json!({
            "proposal_title": proposal.title,
            "branch": candidate.branch,
            "duration_s": verification.duration_s,
        }),
    );

    // The staged diff is the reviewable artifact.
    let staged = git::diff_cached(&candidate.worktree_path).await;
    if let Err(err) = tokio::fs::write(&candidate.patch_path, &staged).await {
        warn!(
            "failed to write patch artifact {}: {err}",
            candidate.patch_path.display()
        );
    }

    if config.git.commit_on_success {
        let message = commit_message(config, run_id, &proposal);
        if let Err(err) = git::commit(
            &candidate.worktree_path,
            &message,
            &config.git.commit_author_name,
            &config.git.commit_author_email,
        )
        .await
        {
            telemetry.log(
                run_id,
                "git_commit_failed",
                json!({
                    "proposal_title": proposal.title,
                    "branch": candidate.branch,
                    "error": redact_text(&err.to_string(), DEFAULT_REDACT_LEN),
                }),
            );
            return CandidateOutcome::Failed(FailedProposal {
                proposal,
                reason: FailureReason::GitCommitFailed,
                details: err.to_string(),
            });
        }
        telemetry.log(
            run_id,
            "git_commit_succeeded",
            json!({"proposal_title": proposal.title, "branch": candidate.branch}),
        );
    }

    CandidateOutcome::Applied(AppliedProposal {
        proposal,
        stat: apply_result.stat,
        verification: Some(verification),
    })
}

fn commit_message(config: &AmbientConfig, run_id: &str, proposal: &Proposal) -> String {
    let subject = config
        .git
        .commit_message_template
        .replace("{title}", &proposal.title)
        .replace("{agent}", &proposal.agent);
    format!(
        "{subject}\n\nrun_id: {run_id}\nrisk_level: {}\ntags: {}\nfiles: {}",
        proposal.risk_level,
        proposal.tags.join(", "),
        proposal.files_touched.join(", "),
    )
}

/// Per-check summaries for telemetry: names, codes, and redacted stderr
/// heads only, never full output.
fn verification_summaries(verification: &VerificationResult) -> Vec<serde_json::Value> {
    verification
        .results
        .iter()
        .map(|check| {
            json!({
                "name": check.name,
                "ok": check.ok,
                "exit_code": check.exit_code,
                "rejected": check.rejected,
                "stderr_head": redact_text(&check.stderr, DEFAULT_REDACT_LEN),
            })
        })
        .collect()
}

fn push_ring(ring: &mut VecDeque<bool>, value: bool, cap: usize) {
    ring.push_back(value);
    while ring.len() > cap.max(1) {
        ring.pop_front();
    }
}

async fn periodic_tick(events_tx: async_channel::Sender<AmbientEvent>, interval_seconds: u64) {
    let interval = Duration::from_secs(interval_seconds.max(1));
    loop {
        tokio::time::sleep(interval).await;
        // Drop silently when the queue is full; the next tick will land.
        let _ = events_tx.try_send(AmbientEvent::periodic_scan());
    }
}
