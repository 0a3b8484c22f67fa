//! Cross-module flows: telemetry feeding the status aggregator, commit-on-
//! success recording, and webhook approval wired through the coordinator.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::HashMap;
use std::time::Duration;

use ambient_core::Coordinator;
use ambient_core::approval::AlwaysApproveHandler;
use ambient_core::approval::WebhookApprovalHandler;
use ambient_core::config::WebhookApprovalConfig;
use ambient_core::coordinator::FailureReason;
use ambient_core::status::compute_status;
use common::StaticAgent;
use common::init_repo;
use common::secret_fix_proposal;
use common::telemetry_types;
use common::read_telemetry;
use common::test_config;
use serde_json::json;
use tempfile::TempDir;
use tokio::process::Command;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_cycle_shows_up_in_status_metrics() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);
    let outcome = coordinator.run_once(None).await;
    assert_eq!(outcome.applied.len(), 1);

    let report = compute_status(&root.join(".ambient/telemetry.jsonl"), 3600.0);
    assert!(report.proposals_per_hour > 0.0);
    assert_eq!(report.apply_success_rate, Some(1.0));
    assert_eq!(report.verify_success_rate, Some(1.0));
    assert!(report.cycle_latency_s_p50.is_some());
    assert!(report.healthy());

    let last = report.last_cycle.expect("last cycle recorded");
    assert_eq!(last["data"]["status"], "success");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_on_success_records_a_commit_and_resets_backoff() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let mut config = test_config();
    config.git.commit_on_success = true;

    let mut coordinator = Coordinator::new(&root, config, Box::new(AlwaysApproveHandler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;
    assert_eq!(outcome.applied.len(), 1, "failed: {:?}", outcome.failed);
    assert_eq!(coordinator.backoff_seconds(), 0);

    let log = Command::new("git")
        .args(["log", "-1", "--pretty=%B"])
        .current_dir(&root)
        .output()
        .await
        .unwrap();
    let message = String::from_utf8_lossy(&log.stdout).to_string();
    assert!(message.starts_with("ambient: Remove hardcoded API key (SecurityGuardian)"));
    assert!(message.contains(&format!("run_id: {}", outcome.run_id)));
    assert!(message.contains("risk_level: low"));

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"git_commit_started".to_string()));
    assert!(types.contains(&"git_commit_succeeded".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_timeout_fails_closed_through_the_gate() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    // The webhook answers "approved" after 3s, but the handler gives up
    // after 1s: the gate must deny.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/approve"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"approved": true}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let handler = WebhookApprovalHandler::new(
        format!("{}/approve", server.uri()),
        &WebhookApprovalConfig {
            url: None,
            headers: HashMap::new(),
            timeout_seconds: 1,
        },
    );

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(handler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;
    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].reason, FailureReason::ApprovalRejected);

    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("sk-1234abcd"));

    let types = telemetry_types(&read_telemetry(&root));
    assert!(types.contains(&"approval_rejected".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_approval_lets_the_proposal_through() {
    let tmp = TempDir::new().unwrap();
    let root = init_repo(&tmp).await;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/approve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"approved": "yes"})))
        .expect(1)
        .mount(&server)
        .await;

    let handler = WebhookApprovalHandler::new(
        format!("{}/approve", server.uri()),
        &WebhookApprovalConfig::default(),
    );

    let mut coordinator = Coordinator::new(&root, test_config(), Box::new(handler));
    coordinator.replace_agents(vec![StaticAgent::boxed(
        "SecurityGuardian",
        vec![secret_fix_proposal("SecurityGuardian")],
    )]);

    let outcome = coordinator.run_once(None).await;
    assert_eq!(outcome.applied.len(), 1, "failed: {:?}", outcome.failed);

    let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
    assert!(contents.contains("os.environ"));
}
