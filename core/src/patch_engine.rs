//! Atomic application of model-emitted unified diffs.
//!
//! The engine is a transaction: on success the touched paths are staged, on
//! any failure the worktree is hard-reset to the committed state and a debug
//! bundle is written for offline diagnosis. Strategies are tried in order,
//! for each candidate diff (as-normalized, then hunk-count-repaired) and each
//! strip level (detected, then inverted):
//!
//! 1. `git apply --check -R`: clean means the diff is already applied;
//!    report success with a distinct status.
//! 2. `git apply --check` then `git apply` forward.
//! 3. `git apply --3way`.
//! 4. The in-process fallback applier from `ambient-apply-patch`.

use std::fmt::Write as _;
use std::path::Path;

use ambient_apply_patch as patch;
use tracing::debug;
use tracing::warn;

use crate::error::AmbientErr;
use crate::git;
use crate::protocol::ApplyResult;

const PATCH_SCRATCH_DIR: &str = ".ambient";
const PATCH_FILE_NAME: &str = "apply.patch";
const ARTIFACTS_DIR: &str = ".ambient_artifacts";
const DEBUG_BUNDLE_DIR: &str = "patch_debug";

struct Attempt {
    args: Vec<String>,
    code: i32,
    stdout: String,
    stderr: String,
}

/// Apply `unified_diff` to the repository at `root`, staging the result.
/// Never leaves a partial application behind: every failure path ends in a
/// hard reset.
pub async fn apply_patch_atomic(root: &Path, unified_diff: &str) -> ApplyResult {
    let normalized = patch::normalize(unified_diff);
    if normalized.is_empty() {
        return ApplyResult::failure("empty patch after normalization");
    }

    let mut attempts: Vec<Attempt> = Vec::new();

    if std::env::var("AMBIENT_PATCH_PREFER_FALLBACK").map(|v| v == "1").unwrap_or(false)
        && let Ok(result) = try_fallback(root, &normalized).await
    {
        return result;
    }

    let mut candidates = vec![normalized.clone()];
    let repaired = patch::fix_hunk_counts(&normalized);
    if repaired != normalized {
        candidates.push(repaired);
    }

    let mut last_err: Option<AmbientErr> = None;
    for candidate in &candidates {
        match apply_with_git(root, candidate, &mut attempts).await {
            Ok(result) => return result,
            Err(err) => last_err = Some(err),
        }
    }

    let message = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "patch apply failed".to_string());
    write_debug_bundle(root, &normalized, &attempts).await;
    git::reset_hard_clean(root).await;
    ApplyResult::failure(message)
}

async fn apply_with_git(
    root: &Path,
    diff: &str,
    attempts: &mut Vec<Attempt>,
) -> Result<ApplyResult, AmbientErr> {
    let scratch = root.join(PATCH_SCRATCH_DIR);
    tokio::fs::create_dir_all(&scratch).await?;
    let patch_path = scratch.join(PATCH_FILE_NAME);
    tokio::fs::write(&patch_path, diff).await?;
    let patch_arg = patch_path.display().to_string();

    let strip_primary = patch::detect_strip_level(diff);
    for strip in [strip_primary, 1 - strip_primary] {
        let strip_arg = format!("-p{strip}");

        let reverse = record(
            root,
            &["apply", "--check", "-R", &strip_arg, &patch_arg],
            attempts,
        )
        .await?;
        if reverse.success() {
            debug!("patch already applied at -p{strip}");
            let stat = stage(root, diff).await?;
            return Ok(ApplyResult {
                ok: true,
                stat,
                stderr: String::new(),
                status: Some("already_applied".to_string()),
            });
        }

        let check = record(root, &["apply", "--check", &strip_arg, &patch_arg], attempts).await?;
        if check.success() {
            let applied = record(root, &["apply", &strip_arg, &patch_arg], attempts).await?;
            if applied.success() {
                let stat = stage(root, diff).await?;
                return Ok(ApplyResult {
                    ok: true,
                    stat,
                    stderr: String::new(),
                    status: None,
                });
            }
        }

        let three_way = record(root, &["apply", "--3way", &strip_arg, &patch_arg], attempts).await?;
        if three_way.success() {
            let stat = stage(root, diff).await?;
            return Ok(ApplyResult {
                ok: true,
                stat,
                stderr: String::new(),
                status: None,
            });
        }
    }

    try_fallback(root, diff).await
}

async fn try_fallback(root: &Path, diff: &str) -> Result<ApplyResult, AmbientErr> {
    let written = patch::apply_fallback(root, diff)
        .map_err(|e| AmbientErr::PatchApply(e.to_string()))?;
    if written.is_empty() {
        return Err(AmbientErr::PatchApply("empty patch after fallback".to_string()));
    }
    git::add(root, &written).await?;
    let stat = git::diff_cached_stat(root).await;
    Ok(ApplyResult {
        ok: true,
        stat,
        stderr: String::new(),
        status: None,
    })
}

async fn stage(root: &Path, diff: &str) -> Result<String, AmbientErr> {
    let paths = patch::extract_paths(diff);
    git::add(root, &paths).await?;
    Ok(git::diff_cached_stat(root).await)
}

async fn record(
    root: &Path,
    args: &[&str],
    attempts: &mut Vec<Attempt>,
) -> Result<git::GitOutput, AmbientErr> {
    let out = git::run_git(root, args).await?;
    attempts.push(Attempt {
        args: args.iter().map(|s| s.to_string()).collect(),
        code: out.code,
        stdout: out.stdout.clone(),
        stderr: out.stderr.clone(),
    });
    Ok(out)
}

/// Write a diagnosis bundle (diff, status, diffstat, attempt transcript, and
/// heads of the touched files) under `.ambient_artifacts/patch_debug/`.
/// Best-effort: bundle failures must not mask the apply failure.
async fn write_debug_bundle(root: &Path, diff: &str, attempts: &[Attempt]) {
    let bundle_dir = root.join(ARTIFACTS_DIR).join(DEBUG_BUNDLE_DIR);
    if let Err(err) = tokio::fs::create_dir_all(&bundle_dir).await {
        warn!("failed to create patch debug bundle dir: {err}");
        return;
    }

    let _ = tokio::fs::write(bundle_dir.join("patch.diff"), diff).await;

    if let Ok(status) = git::run_git(root, &["status", "--porcelain"]).await {
        let _ = tokio::fs::write(bundle_dir.join("status.txt"), status.stdout).await;
    }
    if let Ok(stat) = git::run_git(root, &["diff", "--stat"]).await {
        let _ = tokio::fs::write(bundle_dir.join("diff_stat.txt"), stat.stdout).await;
    }

    let mut transcript = String::new();
    for attempt in attempts {
        let _ = writeln!(
            transcript,
            "$ git {}\nrc={}\nstdout={}\nstderr={}\n",
            attempt.args.join(" "),
            attempt.code,
            attempt.stdout,
            attempt.stderr
        );
    }
    let _ = tokio::fs::write(bundle_dir.join("apply_errors.txt"), transcript).await;

    for rel_path in patch::extract_paths(diff) {
        if patch::is_unsafe_path(&rel_path) {
            continue;
        }
        let file_path = root.join(&rel_path);
        let Ok(contents) = tokio::fs::read_to_string(&file_path).await else {
            continue;
        };
        let head: String = contents.lines().take(80).collect::<Vec<_>>().join("\n");
        let safe_name = rel_path.replace('/', "__");
        let _ = tokio::fs::write(
            bundle_dir.join(format!("head_{safe_name}.txt")),
            format!("{head}\n"),
        )
        .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn init_repo(tmp: &TempDir) -> std::path::PathBuf {
        let root = tmp.path().to_path_buf();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            let out = git::run_git(&root, &args).await.unwrap();
            assert!(out.success(), "git {args:?}: {}", out.stderr);
        }
        std::fs::write(root.join("app.py"), "API_KEY = \"sk-123\"\nprint(API_KEY)\n").unwrap();
        git::run_git(&root, &["add", "-A"]).await.unwrap();
        git::run_git(&root, &["commit", "-m", "initial"]).await.unwrap();
        root
    }

    const FIX_DIFF: &str = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n-API_KEY = \"sk-123\"\n+API_KEY = os.environ[\"API_KEY\"]\n print(API_KEY)\n";

    #[tokio::test]
    async fn applies_clean_diff_and_stages() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let result = apply_patch_atomic(&root, FIX_DIFF).await;
        assert!(result.ok, "stderr: {}", result.stderr);
        assert_eq!(result.status, None);
        assert!(result.stat.contains("app.py"));

        let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
        assert!(contents.contains("os.environ"));
        assert!(git::has_staged_changes(&root).await.unwrap());
    }

    #[tokio::test]
    async fn second_apply_is_idempotent_success() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let first = apply_patch_atomic(&root, FIX_DIFF).await;
        assert!(first.ok);
        let after_first = std::fs::read_to_string(root.join("app.py")).unwrap();

        let second = apply_patch_atomic(&root, FIX_DIFF).await;
        assert!(second.ok, "stderr: {}", second.stderr);
        assert_eq!(second.status.as_deref(), Some("already_applied"));

        let after_second = std::fs::read_to_string(root.join("app.py")).unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn repairs_lying_hunk_counts() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        // Header claims 9 lines; the body is correct.
        let lying = FIX_DIFF.replace("@@ -1,2 +1,2 @@", "@@ -1,9 +1,9 @@");
        let result = apply_patch_atomic(&root, &lying).await;
        assert!(result.ok, "stderr: {}", result.stderr);
        let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
        assert!(contents.contains("os.environ"));
    }

    #[tokio::test]
    async fn strips_markdown_fences() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let fenced = format!("```diff\n{FIX_DIFF}```");
        let result = apply_patch_atomic(&root, &fenced).await;
        assert!(result.ok, "stderr: {}", result.stderr);
    }

    #[tokio::test]
    async fn failure_restores_committed_state() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let bogus = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,2 @@\n-THIS LINE DOES NOT EXIST\n+replacement\n also missing\n";
        let result = apply_patch_atomic(&root, bogus).await;
        assert!(!result.ok);
        assert!(!result.stderr.is_empty());

        let contents = std::fs::read_to_string(root.join("app.py")).unwrap();
        assert_eq!(contents, "API_KEY = \"sk-123\"\nprint(API_KEY)\n");
        let clean = git::is_clean(
            &root,
            &[".ambient/".to_string(), ".ambient_artifacts/".to_string()],
        )
        .await
        .unwrap();
        assert!(clean, "worktree should be restored after failure");
    }

    #[tokio::test]
    async fn failure_writes_debug_bundle() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let bogus = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1,1 +1,1 @@\n-nope\n+yes\n";
        let result = apply_patch_atomic(&root, bogus).await;
        assert!(!result.ok);

        let bundle = root.join(".ambient_artifacts/patch_debug");
        assert!(bundle.join("patch.diff").exists());
        assert!(bundle.join("apply_errors.txt").exists());
        assert!(bundle.join("head_app.py.txt").exists());
    }

    #[tokio::test]
    async fn empty_patch_fails_without_touching_repo() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;
        std::fs::write(root.join("wip.txt"), "uncommitted work\n").unwrap();

        let result = apply_patch_atomic(&root, "```\n```").await;
        assert!(!result.ok);
        assert_eq!(result.stderr, "empty patch after normalization");
        // Nothing was attempted, so pre-existing work survives.
        assert!(root.join("wip.txt").exists());
    }

    #[tokio::test]
    async fn escaping_path_is_refused() {
        let tmp = TempDir::new().unwrap();
        let root = init_repo(&tmp).await;

        let evil = "diff --git a/../evil.py b/../evil.py\n--- a/../evil.py\n+++ b/../evil.py\n@@ -0,0 +1 @@\n+import os\n";
        let result = apply_patch_atomic(&root, evil).await;
        assert!(!result.ok);
        assert!(!tmp.path().parent().map(|p| p.join("evil.py").exists()).unwrap_or(false));
    }
}
