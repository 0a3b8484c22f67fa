//! End-to-end coordinator cycles against real temp git repositories.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use ambient_core::Coordinator;
use ambient_core::CycleStatus;
use ambient_core::approval::AlwaysApproveHandler;
use ambient_core::approval::AlwaysRejectHandler;
use ambient_core::coordinator::FailureReason;
use ambient_core::protocol::RiskLevel;
use common::BrokenAgent;
use common::RejectingHandler;
use common::StaticAgent;
use common::init_repo;
use common::proposal;
use common::read_telemetry;
use common::secret_fix_proposal;
use common::telemetry_types;
use common::test_config;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secret_fix_applies_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.status, CycleStatus::Success);
    assert_eq!(outcome.applied.len(), 1);
    assert!(outcome.failed.is_empty());

    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("os.environ"));
    assert!(!contents.contains("sk-1234abcd"));

    let events = read_telemetry(&root);
    let types = telemetry_types(&events);
    assert!(types.contains(&"cycle_started".to_string()));
    assert!(types.contains(&"proposal".to_string()));
    assert!(types.contains(&"apply_succeeded".to_string()));
    assert!(types.contains(&"verify_succeeded".to_string()));

    let completed = events
        .iter()
        .find(|e| e["type"] == "cycle_completed")
        .expect("cycle_completed logged");
    assert_eq!(completed["data"]["status"], "success");
    assert_eq!(completed["data"]["applied_count"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn high_risk_rejection_leaves_repo_untouched() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut critical = secret_fix_proposal("SecurityGuardian");
    critical.risk_level = RiskLevel::Critical;
    critical.files_touched = vec!["auth.py".to_string()];

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(RejectingHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed("SecurityGuardian", vec![critical])]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.status, CycleStatus::Success);
    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, FailureReason::ApprovalRejected);

    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("sk-1234abcd"), "file must be unchanged");

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"risk_gate_triggered".to_string()));
    assert!(types.contains(&"approval_rejected".to_string()));
    assert!(!types.contains(&"apply_succeeded".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_verification_rolls_back() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;
    // A tests/ directory makes the workspace auto-detect a pytest check,
    // and this test is written to fail.
    std::fs::create_dir(root.join("tests")).unwrap();
    std::fs::write(
        root.join("tests/test_app.py"),
        "def test_broken():\n    assert False\n",
    )
    .unwrap();
    common::git(&root, &["add", "-A"]).await;
    common::git(&root, &["commit", "-m", "add failing test"]).await;

    let before = std::fs::read_to_string(root.join("app.py")).unwrap();

    // Stub mode keeps the check local: pytest either runs and fails on the
    // broken test, or is absent and maps to exit 127. Both fail verification.
    let mut config = test_config();
    config.sandbox.stub_mode = true;

    let mut coordinator = Coordinator::new(&root, config, Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.applied.len(), 0);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, FailureReason::VerificationFailed);

    // Atomicity: the working tree equals its pre-apply state.
    let after = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert_eq!(before, after);

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"apply_succeeded".to_string()));
    assert!(types.contains(&"verify_failed".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dirty_worktree_blocks_application() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;
    std::fs::write(root.join("app.py"), "locally edited\n").unwrap();

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "StyleEnforcer",
        vec![proposal("StyleEnforcer", "tweak", common::SECRET_FIX_DIFF, RiskLevel::Low, &[])],
    )]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, FailureReason::DirtyWorktree);
    // The local edit survives: no patch was attempted.
    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert_eq!(contents, "locally edited\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttle_fails_the_whole_batch() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut config = test_config();
    config.control_plane.max_proposals_per_hour = 2;

    let batch: Vec<_> = (0..5)
        .map(|i| {
            proposal(
                "StyleEnforcer",
                &format!("tweak {i}"),
                "",
                RiskLevel::Low,
                &[],
            )
        })
        .collect();

    let mut coordinator = Coordinator::new(&root, config, Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed("StyleEnforcer", batch)]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.status, CycleStatus::Throttled);
    assert_eq!(outcome.failed.len(), 5);
    assert!(
        outcome
            .failed
            .iter()
            .all(|f| f.reason == FailureReason::Throttled)
    );

    let events = read_telemetry(&root);
    let throttled = events
        .iter()
        .find(|e| e["type"] == "control_plane_throttled")
        .expect("throttle event logged");
    assert_eq!(throttled["data"]["window_size"], 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_skips_without_touching_the_repo() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysRejectHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, FailureReason::DryRun);
    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("sk-1234abcd"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_error_does_not_fail_the_cycle() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![
        BrokenAgent::boxed(),
        StaticAgent::boxed(
            "SecurityGuardian",
            vec![secret_fix_proposal("SecurityGuardian")],
        ),
    ]);

    let outcome = coordinator.run_once(None).await;

    assert_eq!(outcome.status, CycleStatus::Success);
    assert_eq!(outcome.applied.len(), 1);

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"agent_error".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_proposals_completes_quietly() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed("StyleEnforcer", vec![])]);

    let outcome = coordinator.run_once(None).await;
    assert_eq!(outcome.status, CycleStatus::NoProposals);

    let events = read_telemetry(&root);
    let completed = events
        .iter()
        .find(|e| e["type"] == "cycle_completed")
        .unwrap();
    assert_eq!(completed["data"]["status"], "no_proposals");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_rate_kill_switch_disables_auto_apply() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut config = test_config();
    config.control_plane.min_failures_before_disable = 2;
    config.control_plane.failure_rate_threshold = 0.4;

    // A diff that can never apply: every strategy fails, apply_outcomes
    // accumulate `false`.
    let bad_diff = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n-NOT PRESENT\n+nope\n also missing\n";

    let mut coordinator = Coordinator::new(&root, config, Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "StyleEnforcer",
        vec![proposal("StyleEnforcer", "bad", bad_diff, RiskLevel::Low, &[])],
    )]);

    let first = coordinator.run_once(None).await;
    assert_eq!(first.failed[0].reason, FailureReason::PatchFailed);
    let second = coordinator.run_once(None).await;
    assert_eq!(second.failed[0].reason, FailureReason::PatchFailed);

    // Two failures in the tail: rate 1.0 > 0.4 and count ≥ 2.
    let third = coordinator.run_once(None).await;
    assert_eq!(third.failed.len(), 1);
    assert_eq!(third.failed[0].reason, FailureReason::AutoApplyDisabled);

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"control_plane_auto_apply_disabled".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_control_plane_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut config = test_config();
    config.control_plane.paused = true;

    let mut coordinator = Coordinator::new(&root, config, Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;
    assert_eq!(outcome.status, CycleStatus::Paused);

    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("sk-1234abcd"));
}
