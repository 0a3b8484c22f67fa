//! Isolated command execution.
//!
//! Commands are always argv vectors, never shell strings, and are vetted in
//! this order: control-byte rejection, then allowlist admission, then
//! execution. Rejection maps to exit code 126 and never spawns anything; a
//! missing runtime binary maps to exit code 127 with a structured error.
//!
//! Container mode runs the argv inside the configured image with no network,
//! dropped capabilities, no-new-privileges, a read-only root filesystem,
//! noexec tmpfs for `/tmp` and `/var/tmp`, bounded memory/cpu/pids, and the
//! repository mounted read-only (verification default) or read-write. Stub
//! mode spawns the binary directly; it exists for tests and for hosts without
//! a container runtime.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RepoMountMode;
use crate::config::SandboxConfig;

/// Exit code for commands refused by policy (permission denied).
pub const EXIT_REJECTED: i32 = 126;
/// Exit code when the runtime or target binary cannot be found.
pub const EXIT_RUNTIME_MISSING: i32 = 127;
/// Exit code when the command exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = 124;

const CONTAINER_RUNTIME: &str = "docker";

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_s: f64,
    pub rejected: bool,
    pub reject_reason: String,
}

impl ExecOutcome {
    fn rejection(argv: &[String], reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            argv: argv.to_vec(),
            exit_code: EXIT_REJECTED,
            stdout: String::new(),
            stderr: format!("sandbox rejected command: {reason}"),
            duration_s: 0.0,
            rejected: true,
            reject_reason: reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRunner {
    repo_root: PathBuf,
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(repo_root: PathBuf, config: SandboxConfig) -> Self {
        Self { repo_root, config }
    }

    /// Rehome this runner onto another checkout (a review worktree) with the
    /// same policy.
    pub fn with_root(&self, repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            config: self.config.clone(),
        }
    }

    /// Run an argv vector under full policy enforcement.
    pub async fn run(
        &self,
        argv: &[String],
        timeout_s: u64,
        env: &HashMap<String, String>,
    ) -> ExecOutcome {
        self.run_with_enforcement(argv, timeout_s, env, self.config.enforce_allowlist)
            .await
    }

    /// Run with the allowlist check toggled. Doctor probes pass `false`:
    /// they validate the sandbox itself, not user policy.
    pub async fn run_with_enforcement(
        &self,
        argv: &[String],
        timeout_s: u64,
        env: &HashMap<String, String>,
        enforce_allowlist: bool,
    ) -> ExecOutcome {
        if std::env::var("AMBIENT_FAIL_SANDBOX_RUN").map(|v| v == "1").unwrap_or(false) {
            return ExecOutcome {
                argv: argv.to_vec(),
                exit_code: 1,
                stdout: String::new(),
                stderr: "Forced sandbox failure via AMBIENT_FAIL_SANDBOX_RUN".to_string(),
                duration_s: 0.0,
                rejected: false,
                reject_reason: String::new(),
            };
        }

        if argv.is_empty() {
            return ExecOutcome::rejection(argv, "empty argv");
        }

        // Control bytes are refused before any allowlist lookup: a newline
        // inside one element is how a prefix-allowed argv smuggles a second
        // command past shell-based tooling.
        if argv
            .iter()
            .any(|arg| arg.contains('\n') || arg.contains('\r') || arg.contains('\0'))
        {
            return ExecOutcome::rejection(
                argv,
                "argv element contains newline or control byte (\\n, \\r, \\0)",
            );
        }

        if enforce_allowlist {
            if self.config.allowed_argv.is_empty() && self.config.allowed_commands.is_empty() {
                return ExecOutcome::rejection(argv, "empty allowlist");
            }
            if !self.config.is_argv_allowed(argv) {
                let joined = shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_default();
                return ExecOutcome::rejection(argv, format!("argv not in allowlist: {joined}"));
            }
        }

        if self.config.stub_mode {
            self.run_stub(argv, timeout_s, env).await
        } else {
            self.run_container(argv, timeout_s, env).await
        }
    }

    /// Stub mode: spawn the binary directly (never through a shell).
    async fn run_stub(
        &self,
        argv: &[String],
        timeout_s: u64,
        env: &HashMap<String, String>,
    ) -> ExecOutcome {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.repo_root)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.spawn_and_collect(command, argv, timeout_s).await
    }

    async fn run_container(
        &self,
        argv: &[String],
        timeout_s: u64,
        env: &HashMap<String, String>,
    ) -> ExecOutcome {
        let mount_mode = match self.config.repo_mount_mode {
            RepoMountMode::Ro => "ro",
            RepoMountMode::Rw => "rw",
        };

        let mut runtime_argv: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            self.config.network_mode.clone(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,noexec,nosuid".to_string(),
            "--tmpfs".to_string(),
            "/var/tmp:rw,noexec,nosuid".to_string(),
            "--memory".to_string(),
            self.config.resources.memory.clone(),
            "--cpus".to_string(),
            self.config.resources.cpus.clone(),
            "--pids-limit".to_string(),
            self.config.resources.pids_limit.to_string(),
            "-v".to_string(),
            format!("{}:/repo:{mount_mode}", self.repo_root.display()),
            "-w".to_string(),
            "/repo".to_string(),
        ];

        // A worktree checkout carries a `.git` *file* pointing at the main
        // git directory; bind-mount it so git commands resolve inside the
        // container.
        if let Some(gitdir) = worktree_main_git_dir(&self.repo_root) {
            runtime_argv.push("-v".to_string());
            runtime_argv.push(format!("{}:{}", gitdir.display(), gitdir.display()));
        }

        // Tools must not try to write caches into a read-only repo mount.
        runtime_argv.push("-e".to_string());
        runtime_argv.push("HOME=/tmp".to_string());
        runtime_argv.push("-e".to_string());
        runtime_argv.push("XDG_CACHE_HOME=/tmp/xdg-cache".to_string());
        for (key, value) in env {
            runtime_argv.push("-e".to_string());
            runtime_argv.push(format!("{key}={value}"));
        }

        runtime_argv.push(self.config.image.clone());
        runtime_argv.extend(argv.iter().cloned());

        debug!("sandbox: {CONTAINER_RUNTIME} {}", runtime_argv.join(" "));

        let mut command = Command::new(CONTAINER_RUNTIME);
        command
            .args(&runtime_argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.spawn_and_collect(command, argv, timeout_s).await
    }

    async fn spawn_and_collect(
        &self,
        mut command: Command,
        argv: &[String],
        timeout_s: u64,
    ) -> ExecOutcome {
        let start = Instant::now();
        let output = timeout(Duration::from_secs(timeout_s), command.output()).await;
        let duration_s = start.elapsed().as_secs_f64();

        match output {
            Ok(Ok(output)) => ExecOutcome {
                argv: argv.to_vec(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_s,
                rejected: false,
                reject_reason: String::new(),
            },
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => ExecOutcome {
                argv: argv.to_vec(),
                exit_code: EXIT_RUNTIME_MISSING,
                stdout: String::new(),
                stderr: format!("binary not found: {err}"),
                duration_s,
                rejected: false,
                reject_reason: String::new(),
            },
            Ok(Err(err)) => ExecOutcome {
                argv: argv.to_vec(),
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("spawn failed: {err}"),
                duration_s,
                rejected: false,
                reject_reason: String::new(),
            },
            Err(_elapsed) => ExecOutcome {
                argv: argv.to_vec(),
                exit_code: EXIT_TIMEOUT,
                stdout: String::new(),
                stderr: format!("command timed out after {timeout_s}s"),
                duration_s,
                rejected: false,
                reject_reason: String::new(),
            },
        }
    }
}

/// Resolve the main git directory when `.git` under `root` is a worktree
/// pointer file (`gitdir: <path>`).
fn worktree_main_git_dir(root: &Path) -> Option<PathBuf> {
    let git_file = root.join(".git");
    if !git_file.is_file() {
        return None;
    }
    let contents = std::fs::read_to_string(&git_file).ok()?;
    let gitdir = contents.trim().strip_prefix("gitdir:")?.trim();
    let gitdir_path = PathBuf::from(gitdir);
    if !gitdir_path.is_absolute() {
        return None;
    }
    // `<main>/.git/worktrees/<name>` → mount `<main>/.git`'s parent tree.
    let mut main_git_dir = gitdir_path.clone();
    if let Some(idx) = gitdir_path
        .components()
        .position(|c| c.as_os_str() == "worktrees")
    {
        main_git_dir = gitdir_path.components().take(idx).collect();
    }
    main_git_dir.exists().then_some(main_git_dir)
}
