//! Thin adapter over the `git` binary.
//!
//! All repository queries and mutations in the pipeline go through these
//! wrappers so the patch engine and coordinator never assemble git argv
//! inline. Commands run via `tokio::process`; mutating helpers surface
//! failures as [`AmbientErr::Git`], best-effort helpers swallow them.

use std::path::Path;

use tokio::process::Command;

use crate::error::AmbientErr;
use crate::error::Result;

/// Untracked prefixes that never count against worktree cleanliness.
pub const DEFAULT_IGNORED_UNTRACKED_PREFIXES: [&str; 3] =
    [".ambient/", ".ambient_artifacts/", ".pytest_cache/"];

pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub async fn run_git(root: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await?;
    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// `git status --porcelain` lines; empty means clean.
pub async fn status_porcelain(root: &Path) -> Result<Vec<String>> {
    let out = run_git(root, &["status", "--porcelain"]).await?;
    if !out.success() {
        return Err(AmbientErr::Git(format!("git status failed: {}", out.stderr)));
    }
    Ok(out
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// True iff the worktree has no changes, ignoring untracked paths under the
/// given prefixes.
pub async fn is_clean(root: &Path, ignored_untracked_prefixes: &[String]) -> Result<bool> {
    for line in status_porcelain(root).await? {
        if let Some(path) = line.strip_prefix("?? ")
            && ignored_untracked_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        {
            continue;
        }
        return Ok(false);
    }
    Ok(true)
}

/// True if the index has changes (`git diff --cached --quiet` exits 1).
pub async fn has_staged_changes(root: &Path) -> Result<bool> {
    let out = run_git(root, &["diff", "--cached", "--quiet"]).await?;
    match out.code {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(AmbientErr::Git(format!(
            "git diff --cached failed: {}",
            out.stderr
        ))),
    }
}

/// Restore the committed state: hard reset plus untracked-file removal.
/// The coordinator's own state and artifact directories are excluded so a
/// rollback cannot eat the telemetry log or a freshly written debug bundle.
/// Best-effort; there is nothing useful to do when reset fails.
pub async fn reset_hard_clean(root: &Path) {
    let _ = run_git(root, &["reset", "--hard"]).await;
    let _ = run_git(
        root,
        &["clean", "-fd", "-e", ".ambient", "-e", ".ambient_artifacts"],
    )
    .await;
}

/// Commit staged changes with a local identity. "nothing to commit" counts
/// as success so re-runs stay idempotent.
pub async fn commit(
    root: &Path,
    message: &str,
    author_name: &str,
    author_email: &str,
) -> Result<()> {
    let _ = run_git(root, &["config", "user.email", author_email]).await;
    let _ = run_git(root, &["config", "user.name", author_name]).await;

    let out = run_git(root, &["commit", "-m", message]).await?;
    if !out.success() && !out.stdout.contains("nothing to commit") {
        return Err(AmbientErr::Git(format!("commit failed: {}", out.stderr)));
    }
    Ok(())
}

pub async fn create_worktree(root: &Path, branch: &str, path: &Path, reference: &str) -> Result<()> {
    let path_str = path.display().to_string();
    let out = run_git(root, &["worktree", "add", "-b", branch, &path_str, reference]).await?;
    if !out.success() {
        return Err(AmbientErr::Git(format!(
            "failed to create review worktree: {}",
            out.stderr.trim()
        )));
    }
    Ok(())
}

pub async fn remove_worktree(root: &Path, path: &Path) {
    let path_str = path.display().to_string();
    let _ = run_git(root, &["worktree", "remove", "--force", &path_str]).await;
}

pub async fn delete_branch(root: &Path, branch: &str) {
    let _ = run_git(root, &["branch", "-D", branch]).await;
}

/// Tracked files via `git ls-files`, or `None` when not a git repository.
pub async fn ls_files(root: &Path) -> Option<Vec<String>> {
    let out = run_git(root, &["ls-files"]).await.ok()?;
    if !out.success() {
        return None;
    }
    Some(
        out.stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Current unstaged+staged diff against HEAD; empty on any failure.
pub async fn diff_head(root: &Path) -> String {
    match run_git(root, &["diff", "HEAD"]).await {
        Ok(out) if out.success() => out.stdout,
        _ => String::new(),
    }
}

/// Staged diff; empty on any failure.
pub async fn diff_cached(root: &Path) -> String {
    match run_git(root, &["diff", "--cached"]).await {
        Ok(out) if out.success() => out.stdout,
        _ => String::new(),
    }
}

/// Diffstat of the staged changes; empty on any failure.
pub async fn diff_cached_stat(root: &Path) -> String {
    match run_git(root, &["diff", "--cached", "--stat"]).await {
        Ok(out) if out.success() => out.stdout,
        _ => String::new(),
    }
}

/// Stage the given paths, or everything when none could be extracted.
pub async fn add(root: &Path, paths: &[String]) -> Result<()> {
    let out = if paths.is_empty() {
        run_git(root, &["add", "-A"]).await?
    } else {
        let mut args: Vec<&str> = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        run_git(root, &args).await?
    };
    if !out.success() {
        return Err(AmbientErr::Git(format!("git add failed: {}", out.stderr)));
    }
    Ok(())
}
