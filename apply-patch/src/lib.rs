//! Tolerant handling of model-emitted unified diffs.
//!
//! Agents produce unified diffs that are *almost* well-formed: wrapped in
//! Markdown fences, preceded by prose, carrying CRLF line endings, or (most
//! commonly) carrying hunk headers whose line counts do not match the hunk
//! body. This crate normalizes such diffs into something `git apply` will
//! take, repairs hunk counts, and provides an in-process applier used as the
//! last-resort strategy when every `git apply` mode has been exhausted.

mod fallback;

pub use fallback::apply_fallback;

use std::sync::LazyLock;

use regex_lite::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("empty patch after normalization")]
    EmptyPatch,

    #[error("unsafe path in patch: {0}")]
    UnsafePath(String),

    #[error("hunk context mismatch in {path}")]
    ContextMismatch { path: String },

    #[error("hunk removal mismatch in {path}")]
    RemovalMismatch { path: String },

    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
}

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").expect("static regex")
});

/// Normalize a raw model-emitted diff: normalize line endings to LF, strip a
/// surrounding Markdown code fence, drop any prose before the first
/// `diff --git`, and guarantee a trailing newline.
pub fn normalize(raw: &str) -> String {
    let mut cleaned = raw.replace("\r\n", "\n").replace('\r', "\n");
    cleaned = cleaned.trim().to_string();

    if cleaned.starts_with("```") {
        // Drop the opening fence line and anything after the closing fence.
        let body = match cleaned.split_once('\n') {
            Some((_, rest)) => rest,
            None => "",
        };
        let body = match body.rfind("```") {
            Some(idx) => &body[..idx],
            None => body,
        };
        cleaned = body.trim().to_string();
    }

    if let Some(idx) = cleaned.find("diff --git") {
        cleaned = cleaned[idx..].trim().to_string();
    }

    if !cleaned.is_empty() && !cleaned.ends_with('\n') {
        cleaned.push('\n');
    }
    cleaned
}

/// Recount every `@@ -a,b +c,d @@` header from its hunk body.
///
/// Context lines and `-` lines contribute to the old count; context lines and
/// `+` lines contribute to the new count. Start lines are preserved as-is.
/// Returns a repaired copy; callers compare against the input to decide
/// whether a second apply candidate is worth trying.
pub fn fix_hunk_counts(diff: &str) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("@@ ") {
            out.push(line.to_string());
            i += 1;
            continue;
        }
        let Some(caps) = HUNK_HEADER_RE.captures(line) else {
            out.push(line.to_string());
            i += 1;
            continue;
        };
        let old_start = &caps[1];
        let new_start = &caps[3];

        let mut old_count = 0usize;
        let mut new_count = 0usize;
        let mut j = i + 1;
        while j < lines.len() {
            let body = lines[j];
            if body.starts_with("diff --git")
                || body.starts_with("@@ ")
                || body.starts_with("--- ")
                || body.starts_with("+++ ")
            {
                break;
            }
            if body.starts_with('-') {
                old_count += 1;
            } else if body.starts_with('+') {
                new_count += 1;
            } else {
                old_count += 1;
                new_count += 1;
            }
            j += 1;
        }

        out.push(format!("@@ -{old_start},{old_count} +{new_start},{new_count} @@"));
        out.extend(lines[i + 1..j].iter().map(|s| s.to_string()));
        i = j;
    }

    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

/// Detect the `-p` strip level for `git apply`: 1 when the diff carries
/// `a/`/`b/` prefixes, 0 otherwise.
pub fn detect_strip_level(diff: &str) -> u32 {
    if diff.contains("diff --git a/") || diff.contains("\n--- a/") || diff.starts_with("--- a/") {
        1
    } else {
        0
    }
}

/// Extract the repo-relative paths a diff touches, in order of first
/// appearance. Prefers `diff --git` headers; falls back to `+++` lines.
pub fn extract_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();

    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("diff --git ") else {
            continue;
        };
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let b_path = parts[1].strip_prefix("b/").unwrap_or(parts[1]);
        if !paths.iter().any(|p| p == b_path) {
            paths.push(b_path.to_string());
        }
    }
    if !paths.is_empty() {
        return paths;
    }

    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("+++ ") else {
            continue;
        };
        let path = rest.trim();
        let path = path.strip_prefix("b/").unwrap_or(path);
        if path != "/dev/null" && !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}

/// True when a diff path would write outside a repository root: absolute, or
/// containing a `..` component.
pub fn is_unsafe_path(rel_path: &str) -> bool {
    rel_path.starts_with('/') || rel_path.split('/').any(|part| part == "..")
}
