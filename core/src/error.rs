use std::io;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, AmbientErr>;

#[derive(Error, Debug)]
pub enum SandboxErr {
    /// The argv vector was refused before any process was spawned.
    #[error("sandbox rejected command: {0}")]
    Rejected(String),

    /// The container runtime binary could not be found.
    #[error("container runtime not found: {0}")]
    RuntimeMissing(String),

    /// The sandboxed command exceeded its timeout.
    #[error("command timed out after {0}s")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum AmbientErr {
    /// A repo-relative path was absolute, escaped the root, or contained a
    /// forbidden component. Never masked; aborts the containing operation.
    #[error("unsafe path: {0}")]
    UnsafePath(String),

    /// Patch application exhausted every strategy. The worktree has already
    /// been restored to the committed state when this surfaces.
    #[error("patch apply failed: {0}")]
    PatchApply(String),

    #[error("git command failed: {0}")]
    Git(String),

    /// Unexpected HTTP status from the model endpoint.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded on the model endpoint.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("model response had no message content")]
    EmptyModelResponse,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("filesystem watcher error: {0}")]
    Watch(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_path_formats_with_offending_path() {
        let err = AmbientErr::UnsafePath("../etc/passwd".to_string());
        assert_eq!(err.to_string(), "unsafe path: ../etc/passwd");
    }

    #[test]
    fn sandbox_errors_nest_into_ambient_err() {
        let err: AmbientErr = SandboxErr::Rejected("empty allowlist".to_string()).into();
        assert_eq!(
            err.to_string(),
            "sandbox error: sandbox rejected command: empty allowlist"
        );
    }
}
