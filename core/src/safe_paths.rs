//! Repo-relative path validation.
//!
//! Every path that reaches the filesystem on behalf of an agent goes through
//! [`safe_resolve`] first. Validation is strict: absolute candidates,
//! candidates that climb out of the root, and candidates touching forbidden
//! components are all refused with [`AmbientErr::UnsafePath`].

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::AmbientErr;
use crate::error::Result;

/// Components that must never be addressed through a repo-relative path.
pub const FORBIDDEN_COMPONENTS: [&str; 4] = [".git", ".env", ".ssh", ".ambient_secrets"];

/// Resolve `rel_path` against `root`, returning the canonical absolute path.
///
/// The root itself is canonicalized first; on platforms where temp
/// directories are symlinked (macOS `/tmp`), skipping that step would make
/// every in-root path look like an escape.
pub fn safe_resolve(root: &Path, rel_path: &str) -> Result<PathBuf> {
    if rel_path.starts_with('/') {
        return Err(AmbientErr::UnsafePath(format!(
            "absolute paths not allowed: {rel_path}"
        )));
    }

    let root = root
        .canonicalize()
        .map_err(|e| AmbientErr::UnsafePath(format!("cannot canonicalize root: {e}")))?;

    // Lexically flatten the candidate so `..` components cannot smuggle the
    // path out of the root before symlink resolution even runs.
    let mut stack: Vec<std::ffi::OsString> = Vec::new();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(AmbientErr::UnsafePath(format!(
                        "path escapes repo root: {rel_path}"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AmbientErr::UnsafePath(format!(
                    "absolute paths not allowed: {rel_path}"
                )));
            }
        }
    }

    let mut joined = root.clone();
    for part in &stack {
        joined.push(part);
    }

    // Resolve symlinks on the longest existing prefix; the leaf may be a file
    // the patch is about to create.
    let resolved = resolve_existing_prefix(&joined);
    if resolved != root && !resolved.starts_with(&root) {
        return Err(AmbientErr::UnsafePath(format!(
            "path escapes repo root: {rel_path}"
        )));
    }

    for part in resolved.components() {
        if let Component::Normal(name) = part
            && FORBIDDEN_COMPONENTS
                .iter()
                .any(|forbidden| name == *forbidden)
        {
            return Err(AmbientErr::UnsafePath(format!(
                "forbidden path component: {}",
                name.to_string_lossy()
            )));
        }
    }

    Ok(resolved)
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// missing tail, so not-yet-created files still resolve symlinked parents.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => break,
        }
        if !existing.pop() {
            break;
        }
    }

    let mut base = existing.canonicalize().unwrap_or(existing);
    for part in tail.iter().rev() {
        base.push(part);
    }
    base
}
