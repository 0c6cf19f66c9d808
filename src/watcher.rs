//! The file-system watcher adapter (C4): surfaces debounced change events for the raw
//! resource tree as `FileWatcher`-origin resource ids.
//!
//! Two guarantees this module must provide to the scheduler (§4.3):
//!
//! 1. **Debouncing** — repeated writes to the same file within the coalescing window
//!    collapse to at most one event once the file goes quiet.
//! 2. **At-least-once after quiescence** — any sequence of writes ending in quiescence
//!    yields at least one event after the last write.
//!
//! The OS notification primitive (`notify`) runs on its own thread and only ever enqueues
//! raw paths; debouncing and classification happen on a second thread so a burst of editor
//! autosave events never reaches the scheduler as a burst of rebuilds.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::{id::ResourceId, paths::PathRoots, registry::CompilerRegistry};

/// Default coalescing window suggested by §4.3.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Owns the OS watch subscription. Dropping this stops watching; the debounce thread exits
/// once the underlying notify channel disconnects.
pub struct FileSystemWatcher {
    _watcher: RecommendedWatcher,
}

impl FileSystemWatcher {
    /// Starts watching `paths.raw_root()` recursively. Classified, registry-known
    /// `FileWatcher` events are pushed onto `events_tx` for the scheduler to pick up on its
    /// next tick.
    pub fn start(
        paths: Arc<PathRoots>,
        registry: Arc<CompilerRegistry>,
        debounce: Duration,
        events_tx: Sender<ResourceId>,
    ) -> notify::Result<Self> {
        let (raw_tx, raw_rx) = crossbeam_channel::unbounded::<notify::Event>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(error) => {
                    tracing::warn!(%error, "file watcher error");
                }
            }
        })?;
        watcher.watch(paths.raw_root(), RecursiveMode::Recursive)?;

        std::thread::Builder::new()
            .name("resource-watcher-debounce".to_string())
            .spawn(move || debounce_loop(raw_rx, paths, registry, debounce, events_tx))
            .expect("failed to spawn watcher debounce thread");

        Ok(Self { _watcher: watcher })
    }
}

fn debounce_loop(
    raw_rx: Receiver<notify::Event>,
    paths: Arc<PathRoots>,
    registry: Arc<CompilerRegistry>,
    debounce: Duration,
    events_tx: Sender<ResourceId>,
) {
    let mut last_seen: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        match raw_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                let now = Instant::now();
                for path in event.paths {
                    last_seen.insert(path, now);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let quiescent: Vec<PathBuf> = last_seen
            .iter()
            .filter(|(_, &seen)| now.saturating_duration_since(seen) >= debounce)
            .map(|(path, _)| path.clone())
            .collect();

        for path in quiescent {
            last_seen.remove(&path);
            if let Some(id) = classify(&paths, &registry, &path) {
                if events_tx.send(id).is_err() {
                    return;
                }
            }
        }
    }
}

/// Maps an absolute raw-root path to a [`ResourceId`], if it sits under the raw root and its
/// extension is a registered resource type.
fn classify(paths: &PathRoots, registry: &CompilerRegistry, absolute: &std::path::Path) -> Option<ResourceId> {
    let resource_path = paths.from_raw(absolute)?;
    let id = ResourceId::from_path(resource_path).ok()?;
    registry.contains(id.resource_type()).then_some(id)
}
