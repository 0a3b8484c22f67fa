//! Filesystem watcher adapter.
//!
//! Translates `notify` events into [`AmbientEvent`]s on the coordinator's
//! bounded queue. The notify callback runs on a dedicated watcher thread;
//! hand-off uses `try_send`, so a full queue sheds the event (and logs it)
//! instead of ever blocking the producer.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use serde_json::json;
use tracing::debug;
use tracing::warn;
use wildmatch::WildMatch;

use crate::config::MonitoringConfig;
use crate::error::AmbientErr;
use crate::error::Result;
use crate::protocol::AmbientEvent;
use crate::protocol::EventKind;
use crate::telemetry::TelemetrySink;
use crate::util::now_epoch;

/// Path components that are never worth a cycle, regardless of user config.
pub const ALWAYS_IGNORED_COMPONENTS: [&str; 7] = [
    ".git",
    ".ambient",
    ".ambient_artifacts",
    ".pytest_cache",
    "__pycache__",
    "node_modules",
    ".venv",
];

const WATCHER_RUN_ID: &str = "watcher";

/// Pure filtering/debouncing state, separated from the notify plumbing so
/// the drop rules are testable without a real filesystem watcher.
pub struct WatchFilter {
    canonical_root: PathBuf,
    ignore_globs: Vec<WildMatch>,
    debounce: Duration,
    last_accepted: Mutex<HashMap<PathBuf, Instant>>,
}

impl WatchFilter {
    pub fn new(repo_root: &Path, config: &MonitoringConfig) -> Result<Self> {
        let canonical_root = repo_root.canonicalize()?;
        Ok(Self {
            canonical_root,
            ignore_globs: config
                .ignore_patterns
                .iter()
                .map(|pattern| WildMatch::new(pattern))
                .collect(),
            debounce: Duration::from_secs(config.debounce_seconds),
            last_accepted: Mutex::new(HashMap::new()),
        })
    }

    /// Decide whether a notification for `abs_path` becomes an event.
    /// Returns the repo-relative path when accepted.
    pub fn accept(&self, abs_path: &Path, now: Instant) -> Option<String> {
        let resolved = abs_path.canonicalize().unwrap_or_else(|_| abs_path.to_path_buf());
        let rel = resolved.strip_prefix(&self.canonical_root).ok()?;

        let file_name = rel.file_name()?.to_string_lossy().into_owned();
        for component in rel.components() {
            let name = component.as_os_str().to_string_lossy();
            if ALWAYS_IGNORED_COMPONENTS.contains(&name.as_ref()) {
                return None;
            }
        }

        let rel_str = rel.to_string_lossy().into_owned();
        if self
            .ignore_globs
            .iter()
            .any(|glob| glob.matches(&rel_str) || glob.matches(&file_name))
        {
            return None;
        }

        // Per-path debounce: only the first event inside the window counts.
        let mut last = self.last_accepted.lock().ok()?;
        if let Some(&previous) = last.get(rel)
            && now.duration_since(previous) < self.debounce
        {
            return None;
        }
        last.insert(rel.to_path_buf(), now);

        Some(rel_str)
    }
}

/// Owns the running notify watcher; dropping it stops the watcher thread.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

/// Subscribe to the configured watch paths and start feeding the queue.
pub fn spawn_watcher(
    repo_root: &Path,
    config: &MonitoringConfig,
    events_tx: async_channel::Sender<AmbientEvent>,
    telemetry: Arc<TelemetrySink>,
) -> Result<FileWatcher> {
    let filter = Arc::new(WatchFilter::new(repo_root, config)?);

    let handler = move |result: notify::Result<notify::Event>| {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!("watcher error: {err}");
                return;
            }
        };
        for path in &event.paths {
            if path.is_dir() {
                continue;
            }
            let Some(rel_path) = filter.accept(path, Instant::now()) else {
                continue;
            };
            let ambient_event = AmbientEvent::new(
                EventKind::FileChange,
                json!({
                    "rel_path": rel_path,
                    "src_path": path.to_string_lossy(),
                    "timestamp": now_epoch(),
                }),
                json!({
                    "goal": "Continuous code quality monitoring",
                    "trigger": "file_change",
                }),
            );
            match events_tx.try_send(ambient_event) {
                Ok(()) => {
                    telemetry.log(
                        WATCHER_RUN_ID,
                        "event_enqueued",
                        json!({ "rel_path": rel_path }),
                    );
                }
                Err(async_channel::TrySendError::Full(_)) => {
                    debug!("event queue full, dropping {rel_path}");
                    telemetry.log(
                        WATCHER_RUN_ID,
                        "event_dropped",
                        json!({ "reason": "queue_full", "rel_path": rel_path }),
                    );
                }
                Err(async_channel::TrySendError::Closed(_)) => {}
            }
        }
    };

    let mut watcher = RecommendedWatcher::new(handler, notify::Config::default())
        .map_err(|e| AmbientErr::Watch(e.to_string()))?;

    let mut watched_any = false;
    for watch_path in &config.watch_paths {
        let full = repo_root.join(watch_path);
        if full.exists() {
            watcher
                .watch(&full, RecursiveMode::Recursive)
                .map_err(|e| AmbientErr::Watch(e.to_string()))?;
            watched_any = true;
        }
    }
    if !watched_any {
        watcher
            .watch(repo_root, RecursiveMode::Recursive)
            .map_err(|e| AmbientErr::Watch(e.to_string()))?;
    }

    Ok(FileWatcher { _watcher: watcher })
}
