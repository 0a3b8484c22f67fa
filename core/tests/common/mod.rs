//! Shared helpers for coordinator integration tests.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use ambient_core::agents::SpecialistAgent;
use ambient_core::config::AmbientConfig;
use ambient_core::error::AmbientErr;
use ambient_core::error::Result;
use ambient_core::model_client::ModelClient;
use ambient_core::protocol::Proposal;
use ambient_core::protocol::RepoContext;
use ambient_core::protocol::RiskLevel;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::process::Command;

pub async fn git(root: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A committed repo containing `app.py` with a hardcoded key.
pub async fn init_repo(tmp: &TempDir) -> PathBuf {
    let root = tmp.path().to_path_buf();
    git(&root, &["init"]).await;
    git(&root, &["config", "user.email", "test@example.com"]).await;
    git(&root, &["config", "user.name", "Test User"]).await;
    std::fs::write(
        root.join("app.py"),
        "API_KEY = \"sk-1234abcd5678efgh9012cdef\"\nprint(API_KEY)\n",
    )
    .expect("write app.py");
    git(&root, &["add", "-A"]).await;
    git(&root, &["commit", "-m", "initial"]).await;
    root
}

/// The two-line fix for the hardcoded key in `app.py`.
pub const SECRET_FIX_DIFF: &str = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n-API_KEY = \"sk-1234abcd5678efgh9012cdef\"\n+API_KEY = os.environ.get(\"API_KEY\", \"\")\n print(API_KEY)\n";

pub fn secret_fix_proposal(agent: &str) -> Proposal {
    Proposal {
        agent: agent.to_string(),
        title: "Remove hardcoded API key".to_string(),
        description: "Read the key from the environment instead.".to_string(),
        diff: SECRET_FIX_DIFF.to_string(),
        risk_level: RiskLevel::Low,
        rationale: "Hardcoded credentials leak through version control.".to_string(),
        files_touched: vec!["app.py".to_string()],
        estimated_loc_change: 2,
        tags: vec!["security".to_string(), "secret".to_string()],
    }
}

pub fn proposal(agent: &str, title: &str, diff: &str, risk: RiskLevel, tags: &[&str]) -> Proposal {
    Proposal {
        agent: agent.to_string(),
        title: title.to_string(),
        description: "d".to_string(),
        diff: diff.to_string(),
        risk_level: risk,
        rationale: "r".to_string(),
        files_touched: vec!["app.py".to_string()],
        estimated_loc_change: 2,
        tags: tags.iter().map(|s| s.to_string()).collect(),
    }
}

/// Scripted agent: returns canned proposals without a model endpoint.
pub struct StaticAgent {
    name: &'static str,
    proposals: Vec<Proposal>,
    client: Arc<ModelClient>,
}

impl StaticAgent {
    pub fn new(name: &'static str, proposals: Vec<Proposal>) -> Self {
        Self {
            name,
            proposals,
            client: Arc::new(ModelClient::new(ambient_core::config::ModelConfig::default())),
        }
    }

    pub fn boxed(name: &'static str, proposals: Vec<Proposal>) -> Box<dyn SpecialistAgent> {
        Box::new(Self::new(name, proposals))
    }
}

#[async_trait]
impl SpecialistAgent for StaticAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    fn system_prompt(&self) -> &str {
        ""
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }

    async fn propose(&self, _context: &RepoContext) -> Result<Vec<Proposal>> {
        Ok(self.proposals.clone())
    }
}

/// Always errors; for testing per-agent error isolation.
pub struct BrokenAgent {
    client: Arc<ModelClient>,
}

impl BrokenAgent {
    pub fn boxed() -> Box<dyn SpecialistAgent> {
        Box::new(Self {
            client: Arc::new(ModelClient::new(ambient_core::config::ModelConfig::default())),
        })
    }
}

#[async_trait]
impl SpecialistAgent for BrokenAgent {
    fn name(&self) -> &'static str {
        "BrokenAgent"
    }

    fn system_prompt(&self) -> &str {
        ""
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }

    async fn propose(&self, _context: &RepoContext) -> Result<Vec<Proposal>> {
        Err(AmbientErr::EmptyModelResponse)
    }
}

/// Rejects everything but is not the dry-run handler.
pub struct RejectingHandler;

#[async_trait]
impl ambient_core::approval::ApprovalHandler for RejectingHandler {
    async fn request_approval(
        &self,
        _proposal: &Proposal,
        _assessment: &ambient_core::risk::RiskAssessment,
    ) -> bool {
        false
    }
}

pub fn test_config() -> AmbientConfig {
    let mut config = AmbientConfig::default();
    config.monitoring.enabled = false;
    config
}

pub fn read_telemetry(repo: &Path) -> Vec<Value> {
    let path = repo.join(".ambient/telemetry.jsonl");
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("telemetry line is JSON"))
        .collect()
}

pub fn telemetry_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(str::to_string))
        .collect()
}
