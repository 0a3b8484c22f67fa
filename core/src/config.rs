//! Configuration for the ambient coordinator.
//!
//! Loaded from `.ambient.yml` at the repository root, then overridden by
//! `AMBIENT_*` environment variables. Every section has serde defaults so a
//! missing file or a partial file both yield a working configuration.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_FILE_NAME: &str = ".ambient.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelProvider {
    Ollama,
    OpenaiCompatible,
    Anthropic,
}

/// How to reach the chat endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub base_url: String,
    pub model_id: String,
    pub max_concurrency: usize,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            base_url: "http://localhost:11434/v1".to_string(),
            model_id: "kimi-k2.5:cloud".to_string(),
            max_concurrency: 8,
            temperature: 0.2,
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub watch_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub debounce_seconds: u64,
    pub check_interval_seconds: u64,
    pub max_queue_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_paths: vec!["src/".to_string(), "tests/".to_string()],
            ignore_patterns: vec![
                "*.pyc".to_string(),
                "__pycache__".to_string(),
                ".git".to_string(),
            ],
            debounce_seconds: 5,
            check_interval_seconds: 300,
            max_queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub enabled: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                "SecurityGuardian".to_string(),
                "RefactorArchitect".to_string(),
                "StyleEnforcer".to_string(),
                "PerformanceOptimizer".to_string(),
                "TestEnhancer".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RiskPolicyConfig {
    pub auto_apply: Vec<crate::protocol::RiskLevel>,
    pub require_approval: Vec<crate::protocol::RiskLevel>,
    pub file_change_limit: usize,
    pub loc_change_limit: i64,
}

impl Default for RiskPolicyConfig {
    fn default() -> Self {
        use crate::protocol::RiskLevel;
        Self {
            auto_apply: vec![RiskLevel::Low, RiskLevel::Medium],
            require_approval: vec![RiskLevel::High, RiskLevel::Critical],
            file_change_limit: 10,
            loc_change_limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxResourcesConfig {
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

impl Default for SandboxResourcesConfig {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: "2.0".to_string(),
            pids_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMountMode {
    Ro,
    Rw,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub network_mode: String,
    pub resources: SandboxResourcesConfig,
    pub require_runtime: bool,
    pub stub_mode: bool,
    pub enforce_allowlist: bool,
    /// Prefer read-only repo mounts for verification.
    pub repo_mount_mode: RepoMountMode,

    /// Allowlist of argv prefixes. argv is allowed iff it begins with one of
    /// these entries (extra args are permitted).
    pub allowed_argv: Vec<Vec<String>>,

    /// Back-compat: legacy regex allowlist, matched in full against the
    /// shell-joined argv. Prefer `allowed_argv`.
    pub allowed_commands: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let allowed_argv = [
            vec!["pytest"],
            vec!["python", "-m", "pytest"],
            vec!["ruff", "check"],
            vec!["ruff", "format"],
            vec!["mypy"],
            vec!["flake8"],
            vec!["cargo", "test"],
            vec!["cargo", "check"],
            vec!["cargo", "clippy"],
            vec!["npm", "test"],
            vec!["make", "test"],
            vec!["make", "lint"],
            vec!["make", "check"],
            vec!["git", "status"],
            vec!["git", "diff"],
            vec!["git", "log"],
            vec!["git", "show"],
            vec!["git", "rev-parse"],
        ]
        .into_iter()
        .map(|prefix| prefix.into_iter().map(str::to_string).collect())
        .collect();

        Self {
            image: "ambient-sandbox:latest".to_string(),
            network_mode: "none".to_string(),
            resources: SandboxResourcesConfig::default(),
            require_runtime: true,
            stub_mode: false,
            enforce_allowlist: true,
            repo_mount_mode: RepoMountMode::Ro,
            allowed_argv,
            allowed_commands: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// True when argv begins with an allowed prefix, or (legacy) when the
    /// shell-joined argv fully matches a configured regex.
    pub fn is_argv_allowed(&self, argv: &[String]) -> bool {
        if self
            .allowed_argv
            .iter()
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..])
        {
            return true;
        }
        if !self.allowed_commands.is_empty() {
            let joined = shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_default();
            return self.allowed_commands.iter().any(|pattern| {
                regex_lite::Regex::new(&format!("^(?:{pattern})$"))
                    .map(|re| re.is_match(joined.trim()))
                    .unwrap_or(false)
            });
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub timeout_seconds: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub commit_on_success: bool,
    pub require_clean_before_apply: bool,
    pub commit_message_template: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_on_success: false,
            require_clean_before_apply: true,
            commit_message_template: "ambient: {title} ({agent})".to_string(),
            commit_author_name: "Ambient Swarm".to_string(),
            commit_author_email: "ambient@bot.local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReviewWorktreeConfig {
    pub enabled: bool,
    pub base_dir: String,
    pub branch_prefix: String,
    pub max_parallel: usize,
    pub keep_worktrees: bool,
}

impl Default for ReviewWorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_dir: ".ambient/reviews".to_string(),
            branch_prefix: "ambient/review".to_string(),
            max_parallel: 4,
            keep_worktrees: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub webhook: WebhookApprovalConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WebhookApprovalConfig {
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_seconds: u64,
}

impl Default for WebhookApprovalConfig {
    fn default() -> Self {
        Self {
            url: None,
            headers: HashMap::new(),
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
    pub include_diffs: bool,
    pub retention_days: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: ".ambient/telemetry.jsonl".to_string(),
            include_diffs: false,
            retention_days: 30,
        }
    }
}

/// Operational safety controls and kill-switches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub paused: bool,
    /// 0 means unlimited.
    pub max_proposals_per_hour: usize,
    pub failure_rate_window: usize,
    pub disable_auto_apply_on_failure_rate: bool,
    pub failure_rate_threshold: f64,
    pub min_failures_before_disable: usize,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            paused: false,
            max_proposals_per_hour: 0,
            failure_rate_window: 20,
            disable_auto_apply_on_failure_rate: true,
            failure_rate_threshold: 0.5,
            min_failures_before_disable: 3,
            backoff_base_seconds: 30,
            backoff_max_seconds: 600,
        }
    }
}

/// Reserved for future adaptation features.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    pub track_revert_rate: bool,
    pub track_agent_success: bool,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            track_revert_rate: true,
            track_agent_success: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    pub model: ModelConfig,
    pub monitoring: MonitoringConfig,
    pub agents: AgentsConfig,
    pub risk_policy: RiskPolicyConfig,
    pub sandbox: SandboxConfig,
    pub verification: VerificationConfig,
    pub git: GitConfig,
    pub review_worktree: ReviewWorktreeConfig,
    pub approval: ApprovalConfig,
    pub telemetry: TelemetryConfig,
    pub control_plane: ControlPlaneConfig,
    pub learning: LearningConfig,
}

impl AmbientConfig {
    /// Load `.ambient.yml` from the repository root, falling back to defaults
    /// when the file does not exist, then apply `AMBIENT_*` env overrides.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides mirror the YAML tree with an `AMBIENT_` prefix.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("AMBIENT_MODEL_BASE_URL") {
            self.model.base_url = url;
        }
        if let Ok(model) = env::var("AMBIENT_MODEL_ID") {
            self.model.model_id = model;
        }
        if let Ok(temp) = env::var("AMBIENT_MODEL_TEMPERATURE")
            && let Ok(parsed) = temp.parse()
        {
            self.model.temperature = parsed;
        }

        if let Ok(image) = env::var("AMBIENT_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Ok(network) = env::var("AMBIENT_SANDBOX_NETWORK") {
            self.sandbox.network_mode = network;
        }
        if env_is_on("AMBIENT_SANDBOX_STUB") {
            self.sandbox.stub_mode = true;
        }
        if env_is_on("AMBIENT_SANDBOX_DISABLE_ALLOWLIST") {
            self.sandbox.enforce_allowlist = false;
        }

        if let Ok(timeout) = env::var("AMBIENT_VERIFY_TIMEOUT_SECONDS")
            && let Ok(parsed) = timeout.parse()
        {
            self.verification.timeout_seconds = parsed;
        }

        if env_is_on("AMBIENT_GIT_NO_COMMIT") {
            self.git.commit_on_success = false;
        }
        if env_is_on("AMBIENT_GIT_ALLOW_DIRTY") {
            self.git.require_clean_before_apply = false;
        }
        if let Ok(template) = env::var("AMBIENT_GIT_COMMIT_TEMPLATE") {
            self.git.commit_message_template = template;
        }
        if let Ok(name) = env::var("AMBIENT_GIT_AUTHOR_NAME") {
            self.git.commit_author_name = name;
        }
        if let Ok(email) = env::var("AMBIENT_GIT_AUTHOR_EMAIL") {
            self.git.commit_author_email = email;
        }

        if env_is_on("AMBIENT_REVIEW_WORKTREE_DISABLED") {
            self.review_worktree.enabled = false;
        }
        if let Ok(parallel) = env::var("AMBIENT_REVIEW_MAX_PARALLEL")
            && let Ok(parsed) = parallel.parse()
        {
            self.review_worktree.max_parallel = parsed;
        }
        if let Ok(base_dir) = env::var("AMBIENT_REVIEW_BASE_DIR") {
            self.review_worktree.base_dir = base_dir;
        }

        if let Ok(url) = env::var("AMBIENT_APPROVAL_WEBHOOK_URL") {
            self.approval.webhook.url = Some(url);
        }
        if let Ok(timeout) = env::var("AMBIENT_APPROVAL_WEBHOOK_TIMEOUT_SECONDS")
            && let Ok(parsed) = timeout.parse()
        {
            self.approval.webhook.timeout_seconds = parsed;
        }

        if let Ok(log_path) = env::var("AMBIENT_TELEMETRY_PATH") {
            self.telemetry.log_path = log_path;
        }

        if env_is_on("AMBIENT_PAUSED") {
            self.control_plane.paused = true;
        }
        if let Ok(max) = env::var("AMBIENT_MAX_PROPOSALS_PER_HOUR")
            && let Ok(parsed) = max.parse()
        {
            self.control_plane.max_proposals_per_hour = parsed;
        }
        if let Ok(threshold) = env::var("AMBIENT_FAILURE_RATE_THRESHOLD")
            && let Ok(parsed) = threshold.parse()
        {
            self.control_plane.failure_rate_threshold = parsed;
        }
    }
}

fn env_is_on(name: &str) -> bool {
    env::var(name).map(|v| v == "1").unwrap_or(false)
}

/// A starter `.ambient.yml`, written by `ambient init`.
pub const DEFAULT_CONFIG_YAML: &str = r#"model:
  provider: ollama
  base_url: http://localhost:11434/v1
  model_id: kimi-k2.5:cloud
  max_concurrency: 8
  temperature: 0.2
  timeout_seconds: 300

monitoring:
  enabled: true
  watch_paths: [src/, tests/]
  ignore_patterns: ["*.pyc", __pycache__, .git]
  debounce_seconds: 5
  check_interval_seconds: 300
  max_queue_size: 1000

agents:
  enabled:
    - SecurityGuardian
    - RefactorArchitect
    - StyleEnforcer
    - PerformanceOptimizer
    - TestEnhancer

risk_policy:
  auto_apply: [low, medium]
  require_approval: [high, critical]
  file_change_limit: 10
  loc_change_limit: 500

sandbox:
  image: ambient-sandbox:latest
  network_mode: none
  repo_mount_mode: ro

git:
  commit_on_success: false
  require_clean_before_apply: true

telemetry:
  enabled: true
  log_path: .ambient/telemetry.jsonl
  retention_days: 30
"#;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_usable() {
        let config = AmbientConfig::default();
        assert_eq!(config.model.base_url, "http://localhost:11434/v1");
        assert_eq!(config.control_plane.max_proposals_per_hour, 0);
        assert!(config.sandbox.enforce_allowlist);
        assert_eq!(config.sandbox.repo_mount_mode, RepoMountMode::Ro);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "control_plane:\n  max_proposals_per_hour: 7\n";
        let config: AmbientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.control_plane.max_proposals_per_hour, 7);
        // Untouched sections keep their defaults.
        assert_eq!(config.control_plane.failure_rate_window, 20);
        assert_eq!(config.git.commit_message_template, "ambient: {title} ({agent})");
    }

    #[test]
    fn starter_yaml_parses() {
        let config: AmbientConfig = serde_yaml::from_str(DEFAULT_CONFIG_YAML).unwrap();
        assert_eq!(config.agents.enabled.len(), 5);
    }

    #[test]
    fn invalid_repo_mount_mode_is_rejected() {
        let yaml = "sandbox:\n  repo_mount_mode: rwx\n";
        let parsed: std::result::Result<AmbientConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn argv_prefix_allowlist_is_prefix_equality_not_substring() {
        let config = SandboxConfig::default();
        let allowed = ["pytest", "-x"].map(str::to_string);
        assert!(config.is_argv_allowed(&allowed));

        // "pytest" buried in another token must not match.
        let smuggled = ["bash", "-c", "pytest"].map(str::to_string);
        assert!(!config.is_argv_allowed(&smuggled));

        // A shorter argv than the prefix must not match.
        let partial = ["python", "-m"].map(str::to_string);
        assert!(!config.is_argv_allowed(&partial));
    }

    #[test]
    fn legacy_regex_allowlist_matches_joined_argv_in_full() {
        let config = SandboxConfig {
            allowed_argv: Vec::new(),
            allowed_commands: vec!["pytest( -q)?".to_string()],
            ..SandboxConfig::default()
        };
        assert!(config.is_argv_allowed(&["pytest".to_string()]));
        assert!(config.is_argv_allowed(&["pytest".to_string(), "-q".to_string()]));
        assert!(!config.is_argv_allowed(&["pytest".to_string(), "--full".to_string()]));
    }
}
