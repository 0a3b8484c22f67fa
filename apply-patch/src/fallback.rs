//! In-process unified-diff applier.
//!
//! Last-resort strategy after every `git apply` mode has failed. Hunks are
//! verified literally: every context and `-` line must match the current file
//! content exactly (modulo line endings), and any mismatch aborts the whole
//! patch so the caller can roll back.

use std::fs;
use std::path::Path;

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::PatchError;
use crate::is_unsafe_path;

static HUNK_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").expect("static regex")
});

struct Hunk {
    old_start: usize,
    old_count: usize,
    lines: Vec<String>,
}

struct FilePatch {
    path: String,
    hunks: Vec<Hunk>,
}

/// Apply `diff` directly to the files under `root`, returning the written
/// repo-relative paths. Single-hunk whole-file replacements are written
/// atomically without context matching; everything else walks hunks with
/// literal verification.
pub fn apply_fallback(root: &Path, diff: &str) -> Result<Vec<String>, PatchError> {
    let patches = parse(diff);

    let mut written = Vec::new();
    for patch in &patches {
        if is_unsafe_path(&patch.path) {
            return Err(PatchError::UnsafePath(patch.path.clone()));
        }
        apply_one(root, patch)?;
        written.push(patch.path.clone());
    }
    Ok(written)
}

fn parse(diff: &str) -> Vec<FilePatch> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut hunk_lines: Vec<String> = Vec::new();
    let mut old_start = 0usize;
    let mut old_count = 0usize;

    let flush_hunk =
        |patches: &mut Vec<FilePatch>, lines: &mut Vec<String>, start: usize, count: usize| {
            if lines.is_empty() {
                return;
            }
            if let Some(current) = patches.last_mut() {
                current.hunks.push(Hunk {
                    old_start: start,
                    old_count: count,
                    lines: std::mem::take(lines),
                });
            } else {
                lines.clear();
            }
        };

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush_hunk(&mut patches, &mut hunk_lines, old_start, old_count);
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 2 {
                let b_path = parts[1].strip_prefix("b/").unwrap_or(parts[1]);
                patches.push(FilePatch {
                    path: b_path.to_string(),
                    hunks: Vec::new(),
                });
            }
            continue;
        }
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("index ") {
            continue;
        }
        if line.starts_with("@@ ") {
            flush_hunk(&mut patches, &mut hunk_lines, old_start, old_count);
            if let Some(caps) = HUNK_START_RE.captures(line) {
                old_start = caps[1].parse().unwrap_or(0);
                old_count = caps
                    .get(2)
                    .map(|m| m.as_str().parse().unwrap_or(1))
                    .unwrap_or(1);
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('+') || line.starts_with('-') {
            hunk_lines.push(line.to_string());
        }
    }
    flush_hunk(&mut patches, &mut hunk_lines, old_start, old_count);

    patches
}

fn apply_one(root: &Path, patch: &FilePatch) -> Result<(), PatchError> {
    let file_path = root.join(&patch.path);
    let original: Vec<String> = if file_path.exists() {
        let text = fs::read_to_string(&file_path).map_err(|e| PatchError::Io {
            path: patch.path.clone(),
            message: e.to_string(),
        })?;
        text.split_inclusive('\n').map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    };

    // Whole-file replacement: a single hunk spanning the entire file needs no
    // context walk and tolerates files the header counts describe exactly.
    if patch.hunks.len() == 1 {
        let hunk = &patch.hunks[0];
        if hunk.old_start == 1 && original.len() == hunk.old_count {
            let replacement: String = hunk
                .lines
                .iter()
                .filter(|l| l.starts_with('+') || l.starts_with(' '))
                .map(|l| format!("{}\n", &l[1..]))
                .collect();
            return write_file(&file_path, &patch.path, &replacement);
        }
    }

    let mut new_lines: Vec<String> = Vec::new();
    let mut idx = 0usize;
    for hunk in &patch.hunks {
        let start_idx = hunk.old_start.saturating_sub(1).min(original.len());
        if start_idx > idx {
            new_lines.extend_from_slice(&original[idx..start_idx]);
            idx = start_idx;
        }
        for line in &hunk.lines {
            if let Some(ctx) = line.strip_prefix(' ') {
                if idx >= original.len() || trim_eol(&original[idx]) != ctx {
                    return Err(PatchError::ContextMismatch {
                        path: patch.path.clone(),
                    });
                }
                new_lines.push(original[idx].clone());
                idx += 1;
            } else if let Some(removed) = line.strip_prefix('-') {
                if idx >= original.len() || trim_eol(&original[idx]) != removed {
                    return Err(PatchError::RemovalMismatch {
                        path: patch.path.clone(),
                    });
                }
                idx += 1;
            } else if let Some(added) = line.strip_prefix('+') {
                new_lines.push(format!("{added}\n"));
            }
        }
    }
    new_lines.extend_from_slice(&original[idx..]);

    write_file(&file_path, &patch.path, &new_lines.concat())
}

fn trim_eol(line: &str) -> &str {
    line.trim_end_matches('\n').trim_end_matches('\r')
}

fn write_file(file_path: &Path, rel_path: &str, contents: &str) -> Result<(), PatchError> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent).map_err(|e| PatchError::Io {
            path: rel_path.to_string(),
            message: e.to_string(),
        })?;
    }
    fs::write(file_path, contents).map_err(|e| PatchError::Io {
        path: rel_path.to_string(),
        message: e.to_string(),
    })
}
