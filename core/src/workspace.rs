//! Workspace: context assembly, sandboxed verification, and rollback.
//!
//! Owns the sandbox runner and the auto-detected verification checks for one
//! repository. Context building is read-only; the only mutations reachable
//! from here are the patch engine (delegated) and rollback.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use futures::future::join_all;
use serde_json::Value;
use serde_json::json;

use crate::config::AmbientConfig;
use crate::error::Result;
use crate::git;
use crate::impact::DEFAULT_MAX_IMPACT_FILES;
use crate::impact::ImportExtractor;
use crate::impact::PythonImportExtractor;
use crate::impact::compute_impact_radius;
use crate::impact::extract_changed_paths;
use crate::patch_engine;
use crate::protocol::AmbientEvent;
use crate::protocol::ApplyResult;
use crate::protocol::CheckResult;
use crate::protocol::Proposal;
use crate::protocol::RepoContext;
use crate::protocol::RepoTree;
use crate::protocol::VerificationResult;
use crate::sandbox::ExecOutcome;
use crate::sandbox::SandboxRunner;
use crate::safe_paths::safe_resolve;

/// Per-file content cap for context reads.
const MAX_FILE_BYTES: usize = 200_000;
/// At most this many impact-radius sources are read into the context.
const MAX_IMPACT_SOURCES: usize = 50;

/// Config files worth showing to every agent when present.
const IMPORTANT_FILES: [&str; 7] = [
    "pyproject.toml",
    "ruff.toml",
    "setup.cfg",
    "requirements.txt",
    "Makefile",
    "README.md",
    ".github/workflows/ci.yml",
];

#[derive(Debug, Clone)]
pub struct VerificationCheck {
    pub name: String,
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

pub struct Workspace {
    repo_path: PathBuf,
    sandbox: SandboxRunner,
    verification_timeout: u64,
    checks: Vec<VerificationCheck>,
    extractor: Box<dyn ImportExtractor>,
}

impl Workspace {
    pub fn new(repo_path: &Path, config: &AmbientConfig) -> Self {
        let mut workspace = Self {
            repo_path: repo_path.to_path_buf(),
            sandbox: SandboxRunner::new(repo_path.to_path_buf(), config.sandbox.clone()),
            verification_timeout: config.verification.timeout_seconds,
            checks: Vec::new(),
            extractor: Box::new(PythonImportExtractor),
        };
        workspace.auto_detect_checks();
        workspace
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn checks(&self) -> &[VerificationCheck] {
        &self.checks
    }

    /// Detect verification checks from repository markers.
    fn auto_detect_checks(&mut self) {
        self.checks.clear();

        // Keep verification from writing into a read-only repo mount.
        let base_env: HashMap<String, String> = [
            ("HOME", "/tmp"),
            ("XDG_CACHE_HOME", "/tmp/xdg-cache"),
            ("PYTHONPYCACHEPREFIX", "/tmp/pycache"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        if self.repo_path.join("tests").exists() || self.repo_path.join("test").exists() {
            self.register_verification(
                "pytest",
                &[
                    "pytest",
                    "-x",
                    "-p",
                    "no:cacheprovider",
                    "--basetemp=/tmp/pytest",
                ],
                base_env.clone(),
            );
        }

        if self.repo_path.join("pyproject.toml").exists()
            || self.repo_path.join("ruff.toml").exists()
        {
            self.register_verification(
                "ruff",
                &["ruff", "check", ".", "--cache-dir", "/tmp/ruff-cache"],
                base_env.clone(),
            );
        }

        if self.repo_path.join("mypy.ini").exists() || self.repo_path.join("pyproject.toml").exists()
        {
            self.register_verification(
                "mypy",
                &["mypy", ".", "--cache-dir", "/tmp/mypy-cache"],
                base_env.clone(),
            );
        }

        if self.repo_path.join("Makefile").exists() {
            self.register_verification("make-test", &["make", "test"], base_env);
        }
    }

    pub fn register_verification(
        &mut self,
        name: &str,
        argv: &[&str],
        env: HashMap<String, String>,
    ) {
        self.checks.push(VerificationCheck {
            name: name.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env,
        });
    }

    /// Apply a proposal's diff atomically to the main worktree.
    pub async fn apply_patch(&self, proposal: &Proposal) -> ApplyResult {
        patch_engine::apply_patch_atomic(&self.repo_path, &proposal.diff).await
    }

    /// Run every verification check concurrently in the sandbox against the
    /// main worktree.
    pub async fn verify_changes(&self) -> VerificationResult {
        self.verify_with(&self.sandbox).await
    }

    /// Verify inside another checkout (a review worktree) with the same
    /// checks and policy.
    pub async fn verify_at(&self, root: &Path) -> VerificationResult {
        let sandbox = self.sandbox.with_root(root.to_path_buf());
        self.verify_with(&sandbox).await
    }

    async fn verify_with(&self, sandbox: &SandboxRunner) -> VerificationResult {
        if self.checks.is_empty() {
            return VerificationResult::from_results(Vec::new());
        }

        let runs = self.checks.iter().map(|check| async {
            let outcome = sandbox
                .run(&check.argv, self.verification_timeout, &check.env)
                .await;
            check_result(&check.name, outcome)
        });
        let results = join_all(runs).await;
        VerificationResult::from_results(results)
    }

    /// Probe the sandbox boundary and required tooling. Allowlist
    /// enforcement is disabled: probes validate the sandbox, not policy.
    pub async fn doctor(&self) -> Vec<CheckResult> {
        let mut probes: Vec<Vec<String>> = vec![
            vec!["python".to_string(), "--version".to_string()],
            vec!["git".to_string(), "--version".to_string()],
        ];
        for check in &self.checks {
            if let Some(tool) = check.argv.first() {
                let probe = vec![tool.clone(), "--version".to_string()];
                if !probes.contains(&probe) {
                    probes.push(probe);
                }
            }
        }

        let runs = probes.into_iter().map(|argv| async move {
            let outcome = self
                .sandbox
                .run_with_enforcement(&argv, 30, &HashMap::new(), false)
                .await;
            check_result(&argv.join(" "), outcome)
        });
        join_all(runs).await
    }

    /// Restore the main worktree to the committed state.
    pub async fn rollback(&self) {
        git::reset_hard_clean(&self.repo_path).await;
    }

    pub async fn staged_diff(&self) -> String {
        git::diff_cached(&self.repo_path).await
    }

    pub fn safe_resolve_path(&self, rel_path: &str) -> Result<PathBuf> {
        safe_resolve(&self.repo_path, rel_path)
    }

    /// Build the cycle-scoped repository snapshot for agents.
    pub async fn build_context(&self, event: &AmbientEvent) -> Result<RepoContext> {
        let failing_logs = if event.is_ci_failure() {
            event.data["logs"].as_str().unwrap_or_default().to_string()
        } else {
            String::new()
        };

        let tree = self.build_tree().await;
        let current_diff = git::diff_head(&self.repo_path).await;

        let event_rel_path = self.event_rel_path(event);
        let changed = extract_changed_paths(event_rel_path.as_deref(), &current_diff);
        let impact_paths = compute_impact_radius(
            &self.repo_path,
            &tree.files,
            &changed,
            self.extractor.as_ref(),
            DEFAULT_MAX_IMPACT_FILES,
        );

        let mut important_files = BTreeMap::new();
        for name in IMPORTANT_FILES {
            if let Some(contents) = self.read_capped(name) {
                important_files.insert(name.to_string(), contents);
            }
        }

        let mut impact_sources = BTreeMap::new();
        for path in impact_paths.iter().take(MAX_IMPACT_SOURCES) {
            if let Some(contents) = self.read_capped(path) {
                impact_sources.insert(path.clone(), contents);
            }
        }

        let task = if event.task_spec.is_null() {
            json!({ "goal": "Continuous code quality monitoring", "trigger": event.kind })
        } else {
            event.task_spec.clone()
        };

        let mut conventions: BTreeMap<String, Value> = BTreeMap::new();
        conventions.insert("analysis_scope".to_string(), json!("impact_radius"));

        Ok(RepoContext {
            task,
            tree,
            important_files,
            impact_sources,
            failing_logs,
            current_diff,
            hot_paths: impact_paths,
            conventions,
        })
    }

    fn event_rel_path(&self, event: &AmbientEvent) -> Option<String> {
        if let Some(rel) = event.data["rel_path"].as_str() {
            return Some(rel.to_string());
        }
        let src = event.data["src_path"].as_str()?;
        let canonical_root = self.repo_path.canonicalize().ok()?;
        let canonical_src = Path::new(src).canonicalize().ok()?;
        canonical_src
            .strip_prefix(&canonical_root)
            .ok()
            .map(|rel| rel.to_string_lossy().into_owned())
    }

    /// Tracked files via git, falling back to a filesystem walk.
    async fn build_tree(&self) -> RepoTree {
        if let Some(files) = git::ls_files(&self.repo_path).await {
            let total_files = files.len();
            return RepoTree { files, total_files };
        }

        let mut files = Vec::new();
        walk_dir(&self.repo_path, &self.repo_path, &mut files);
        files.sort();
        let total_files = files.len();
        RepoTree { files, total_files }
    }

    fn read_capped(&self, rel_path: &str) -> Option<String> {
        let full = self.safe_resolve_path(rel_path).ok()?;
        if !full.is_file() {
            return None;
        }
        let contents = std::fs::read_to_string(full).ok()?;
        if contents.len() <= MAX_FILE_BYTES {
            return Some(contents);
        }
        let mut cut = MAX_FILE_BYTES;
        while cut > 0 && !contents.is_char_boundary(cut) {
            cut -= 1;
        }
        Some(contents[..cut].to_string())
    }
}

fn check_result(name: &str, outcome: ExecOutcome) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        ok: outcome.exit_code == 0,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        duration_s: outcome.duration_s,
        rejected: outcome.rejected,
        reject_reason: outcome.reject_reason,
    }
}

fn walk_dir(root: &Path, dir: &Path, files: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        if path.is_dir() {
            walk_dir(root, &path, files);
        } else if let Ok(rel) = path.strip_prefix(root) {
            files.push(rel.to_string_lossy().into_owned());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::protocol::EventKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn stub_config(allowed: &[&[&str]]) -> AmbientConfig {
        AmbientConfig {
            sandbox: SandboxConfig {
                stub_mode: true,
                allowed_argv: allowed
                    .iter()
                    .map(|prefix| prefix.iter().map(|s| s.to_string()).collect())
                    .collect(),
                ..SandboxConfig::default()
            },
            ..AmbientConfig::default()
        }
    }

    #[test]
    fn auto_detects_checks_from_markers() {
        let tmp = TempDir::new().unwrap();
        {
            std::fs::create_dir(tmp.path().join("tests")).unwrap();
            std::fs::write(tmp.path().join("pyproject.toml"), "[tool.ruff]\n").unwrap();
            std::fs::write(tmp.path().join("Makefile"), "test:\n\ttrue\n").unwrap();
        }
        let workspace = Workspace::new(tmp.path(), &AmbientConfig::default());
        let names: Vec<&str> = workspace.checks().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["pytest", "ruff", "mypy", "make-test"]);
    }

    #[test]
    fn bare_repo_has_no_checks() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path(), &AmbientConfig::default());
        assert!(workspace.checks().is_empty());
    }

    #[tokio::test]
    async fn no_checks_verifies_vacuously() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path(), &AmbientConfig::default());
        let result = workspace.verify_changes().await;
        assert!(result.ok);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn verification_aggregates_check_outcomes() {
        let tmp = TempDir::new().unwrap();
        let mut workspace = Workspace::new(tmp.path(), &stub_config(&[&["echo"], &["false"]]));
        workspace.register_verification("ok-check", &["echo", "fine"], HashMap::new());
        workspace.register_verification("fail-check", &["false"], HashMap::new());

        let result = workspace.verify_changes().await;
        assert!(!result.ok);
        assert_eq!(result.results.len(), 2);
        assert!(result.results[0].ok);
        assert!(!result.results[1].ok);
    }

    #[tokio::test]
    async fn rejected_check_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let mut workspace = Workspace::new(tmp.path(), &stub_config(&[&["echo"]]));
        workspace.register_verification("not-allowed", &["pytest"], HashMap::new());

        let result = workspace.verify_changes().await;
        assert!(!result.ok);
        assert!(result.results[0].rejected);
        assert_eq!(result.results[0].exit_code, 126);
    }

    #[tokio::test]
    async fn doctor_probes_run_without_allowlist() {
        let tmp = TempDir::new().unwrap();
        // Empty allowlist: policy would fail closed, doctor must not.
        let workspace = Workspace::new(tmp.path(), &stub_config(&[]));
        let probes = workspace.doctor().await;
        assert!(probes.iter().any(|p| p.name == "git --version"));
        assert!(probes.iter().all(|p| !p.rejected));
    }

    #[tokio::test]
    async fn build_context_collects_tree_configs_and_impact() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "t@e.com"],
            vec!["config", "user.name", "T"],
        ] {
            git::run_git(root, &args).await.unwrap();
        }
        {
            std::fs::create_dir(root.join("src")).unwrap();
            std::fs::write(root.join("src/app.py"), "import src.util\n").unwrap();
            std::fs::write(root.join("src/util.py"), "x = 1\n").unwrap();
            std::fs::write(root.join("pyproject.toml"), "[project]\nname='x'\n").unwrap();
        }
        git::run_git(root, &["add", "-A"]).await.unwrap();
        git::run_git(root, &["commit", "-m", "initial"]).await.unwrap();

        let workspace = Workspace::new(root, &AmbientConfig::default());
        let event = AmbientEvent::new(
            EventKind::FileChange,
            json!({"rel_path": "src/app.py"}),
            json!({"goal": "test goal"}),
        );
        let context = workspace.build_context(&event).await.unwrap();

        assert_eq!(context.tree.total_files, 3);
        assert!(context.important_files.contains_key("pyproject.toml"));
        assert_eq!(context.hot_paths[0], "src/app.py");
        assert!(context.hot_paths.contains(&"src/util.py".to_string()));
        assert!(context.impact_sources.contains_key("src/app.py"));
        assert_eq!(context.task["goal"], "test goal");
        assert_eq!(context.conventions["analysis_scope"], "impact_radius");
    }

    #[tokio::test]
    async fn ci_failure_event_carries_logs_into_context() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path(), &AmbientConfig::default());
        let event = AmbientEvent::new(
            EventKind::CiFailure,
            json!({"logs": "FAILED tests/test_app.py::test_x"}),
            Value::Null,
        );
        let context = workspace.build_context(&event).await.unwrap();
        assert_eq!(context.failing_logs, "FAILED tests/test_app.py::test_x");
    }
}
