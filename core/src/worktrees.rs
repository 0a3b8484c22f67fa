//! Per-proposal review worktrees.
//!
//! In review mode each approved proposal gets its own branch and worktree
//! under `<base_dir>/<run_id>/worktrees/`, with a patch artifact alongside in
//! `patches/`. Workers on distinct worktrees are independent writers, which
//! is what lets review mode parallelize.

use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::warn;

use crate::error::Result;
use crate::git;
use crate::protocol::ReviewCandidate;

pub struct ReviewWorktreeManager {
    repo_path: PathBuf,
    base_dir: PathBuf,
    branch_prefix: String,
}

impl ReviewWorktreeManager {
    pub fn new(repo_path: &Path, base_dir: &str, branch_prefix: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            base_dir: repo_path.join(base_dir),
            branch_prefix: branch_prefix.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn prepare_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let run_dir = self.base_dir.join(run_id);
        std::fs::create_dir_all(run_dir.join("worktrees"))?;
        std::fs::create_dir_all(run_dir.join("patches"))?;
        Ok(run_dir)
    }

    /// Create the branch + worktree pair for one proposal. A stale worktree
    /// at the same path is force-removed first.
    pub async fn create_candidate(
        &self,
        run_id: &str,
        index: usize,
        title: &str,
    ) -> Result<ReviewCandidate> {
        let run_dir = self.prepare_run_dir(run_id)?;
        let slug = slugify(title);

        let worktree_path = run_dir.join("worktrees").join(format!("{index:02}-{slug}"));
        let patch_path = run_dir.join("patches").join(format!("{index:02}-{slug}.diff"));
        let branch = format!("{}/{run_id}/{index:02}-{slug}", self.branch_prefix);

        if worktree_path.exists() {
            git::remove_worktree(&self.repo_path, &worktree_path).await;
        }

        git::create_worktree(&self.repo_path, &branch, &worktree_path, "HEAD").await?;

        Ok(ReviewCandidate {
            index,
            title_slug: slug,
            branch,
            worktree_path,
            patch_path,
        })
    }

    /// Best-effort teardown: remove the worktree and delete the branch.
    pub async fn remove_candidate(&self, candidate: &ReviewCandidate) {
        git::remove_worktree(&self.repo_path, &candidate.worktree_path).await;
        git::delete_branch(&self.repo_path, &candidate.branch).await;
        if candidate.worktree_path.exists() {
            warn!(
                "review worktree not fully removed: {}",
                candidate.worktree_path.display()
            );
        }
    }
}

static SLUG_INVALID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"[^a-zA-Z0-9._-]+").expect("static regex")
});
static SLUG_DASH_RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"-+").expect("static regex")
});

/// Normalize titles for branch/file naming: alphanumerics plus `._-`,
/// collapsed runs, trimmed, capped at 48 chars, defaulting to "proposal".
pub fn slugify(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let cleaned = SLUG_INVALID_RE.replace_all(&lowered, "-");
    let collapsed = SLUG_DASH_RUN_RE.replace_all(&cleaned, "-");
    let trimmed = collapsed.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    let capped: String = trimmed.chars().take(48).collect();
    if capped.is_empty() {
        "proposal".to_string()
    } else {
        capped
    }
}
