//! Impact radius analysis.
//!
//! Expands beyond directly changed files so agents and verification inspect
//! adjacent modules and likely tests. The language-specific part (how to read
//! imports out of a source file) sits behind [`ImportExtractor`]; the shipped
//! extractor understands Python.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;

pub const DEFAULT_MAX_IMPACT_FILES: usize = 120;

static DIFF_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?m)^\+\+\+ b/(.+)$").expect("static regex")
});

/// Language seam: resolve source files to module names and read their
/// imports.
pub trait ImportExtractor: Send + Sync {
    /// Module name for a tracked path, or `None` when the file is not a
    /// source file this extractor understands.
    fn module_name(&self, path: &str) -> Option<String>;

    /// Imported module names appearing in `contents`.
    fn parse_imports(&self, contents: &str) -> BTreeSet<String>;

    /// Conventional test-file candidates for a source path.
    fn candidate_test_paths(&self, path: &str) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct PythonImportExtractor;

static PY_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?m)^\s*(?:from\s+([\w\.]+)\s+import\s+|import\s+([\w\.,\s]+))")
        .expect("static regex")
});

impl ImportExtractor for PythonImportExtractor {
    fn module_name(&self, path: &str) -> Option<String> {
        let stripped = path
            .strip_suffix("/__init__.py")
            .or_else(|| path.strip_suffix(".py"))?;
        let module = stripped.replace('/', ".");
        let module = module.trim_matches('.').to_string();
        (!module.is_empty()).then_some(module)
    }

    fn parse_imports(&self, contents: &str) -> BTreeSet<String> {
        let mut imports = BTreeSet::new();
        for caps in PY_IMPORT_RE.captures_iter(contents) {
            if let Some(from_mod) = caps.get(1) {
                imports.insert(from_mod.as_str().trim().to_string());
                continue;
            }
            if let Some(import_mods) = caps.get(2) {
                for part in import_mods.as_str().split(',') {
                    let module = part.trim().split(" as ").next().unwrap_or("").trim();
                    if !module.is_empty() {
                        imports.insert(module.to_string());
                    }
                }
            }
        }
        imports
    }

    fn candidate_test_paths(&self, path: &str) -> Vec<String> {
        let p = Path::new(path);
        let mut stem = p
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem == "__init__" {
            stem = p
                .parent()
                .and_then(|d| d.file_name())
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        let parent = p
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut candidates = vec![format!("tests/test_{stem}.py")];
        if !parent.is_empty() && parent != "." {
            candidates.push(format!("tests/{parent}/test_{stem}.py"));
        }
        candidates.push(format!("test/test_{stem}.py"));
        candidates.dedup();
        candidates
    }
}

/// Extract changed repo-relative paths from event metadata and the current
/// diff, order-preserving and deduplicated.
pub fn extract_changed_paths(event_rel_path: Option<&str>, current_diff: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();

    if let Some(rel) = event_rel_path {
        let trimmed = rel.trim();
        if !trimmed.is_empty() && seen.insert(trimmed.to_string()) {
            ordered.push(trimmed.to_string());
        }
    }

    for caps in DIFF_PATH_RE.captures_iter(current_diff) {
        let path = caps[1].trim().to_string();
        if !path.is_empty() && path != "/dev/null" && seen.insert(path.clone()) {
            ordered.push(path);
        }
    }

    ordered
}

/// Compute an ordered, capped impact radius around `changed_paths`:
/// the changed files themselves, their direct dependencies and dependees in
/// the import graph, and conventionally named tests that exist in the tree.
pub fn compute_impact_radius(
    repo_path: &Path,
    tree_files: &[String],
    changed_paths: &[String],
    extractor: &dyn ImportExtractor,
    max_files: usize,
) -> Vec<String> {
    let tree_set: BTreeSet<&str> = tree_files
        .iter()
        .filter(|p| !p.is_empty() && !p.ends_with('/'))
        .map(String::as_str)
        .collect();

    let changed: Vec<&str> = changed_paths
        .iter()
        .map(String::as_str)
        .filter(|p| tree_set.contains(p))
        .collect();
    if changed.is_empty() {
        return Vec::new();
    }

    let mut path_by_module: BTreeMap<String, &str> = BTreeMap::new();
    let mut module_paths: Vec<&str> = Vec::new();
    for &path in &tree_set {
        if let Some(module) = extractor.module_name(path) {
            path_by_module.insert(module, path);
            module_paths.push(path);
        }
    }

    let mut imports_by_path: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for &path in &module_paths {
        let contents = std::fs::read_to_string(repo_path.join(path)).unwrap_or_default();
        imports_by_path.insert(path, extractor.parse_imports(&contents));
    }

    let mut importers_by_path: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (&path, imports) in &imports_by_path {
        for imported in imports {
            if let Some(target) = resolve_module(imported, &path_by_module) {
                importers_by_path.entry(target).or_default().insert(path);
            }
        }
    }

    let mut ordered: Vec<String> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    fn add<'a>(
        path: &str,
        tree_set: &BTreeSet<&'a str>,
        ordered: &mut Vec<String>,
        seen: &mut BTreeSet<&'a str>,
    ) {
        if let Some(&tracked) = tree_set.get(path)
            && seen.insert(tracked)
        {
            ordered.push(tracked.to_string());
        }
    }

    for &path in &changed {
        add(path, &tree_set, &mut ordered, &mut seen);
    }

    for &path in &changed {
        if extractor.module_name(path).is_none() {
            continue;
        }

        if let Some(imports) = imports_by_path.get(path) {
            for imported in imports {
                if let Some(dep) = resolve_module(imported, &path_by_module) {
                    add(dep, &tree_set, &mut ordered, &mut seen);
                }
            }
        }
        if let Some(importers) = importers_by_path.get(path) {
            for &importer in importers {
                add(importer, &tree_set, &mut ordered, &mut seen);
            }
        }

        for test_path in extractor.candidate_test_paths(path) {
            add(&test_path, &tree_set, &mut ordered, &mut seen);
        }
    }

    ordered.truncate(max_files.max(1));
    ordered
}

/// Exact module match, then longest-prefix match so `import pkg.sub.mod`
/// still resolves when only `pkg.sub` is tracked.
fn resolve_module<'a>(module: &str, path_by_module: &BTreeMap<String, &'a str>) -> Option<&'a str> {
    if let Some(&path) = path_by_module.get(module) {
        return Some(path);
    }
    let parts: Vec<&str> = module.split('.').collect();
    for i in (1..parts.len()).rev() {
        let candidate = parts[..i].join(".");
        if let Some(&path) = path_by_module.get(&candidate) {
            return Some(path);
        }
    }
    None
}
