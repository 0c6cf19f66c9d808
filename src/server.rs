//! Settings & lifecycle (C11): owns startup/shutdown ordering and the top-level tick.
//!
//! Startup is strictly ordered per §4.11: config -> record store -> compiler registry ->
//! worker pool (constructed but not dispatched) -> IPC server (accepting) -> file-system
//! watcher (emitting). Shutdown reverses it: stop the watcher, stop accepting new IPC
//! connections' *work* by draining what's in flight, stop workers, persist the record
//! store, free.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fs2::FileExt;

use crate::{
    config::Config,
    error::ServerError,
    ipc::IpcServer,
    paths::PathRoots,
    record::RecordStore,
    registry::CompilerRegistry,
    scheduler::Scheduler,
    watcher::{FileSystemWatcher, DEFAULT_DEBOUNCE},
    worker::WorkerPool,
};

/// Worker subprocess timeout (§5: "suggested 10 minutes").
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(600);

/// The running server: everything [`Scheduler::tick`] needs, plus the resources whose
/// lifetime brackets the whole process (the watcher subscription and the singleton lock).
pub struct Server {
    scheduler: Scheduler,
    watcher: Option<FileSystemWatcher>,
    _singleton_lock: File,
}

impl Server {
    /// Runs the ordered startup sequence and returns a server ready to [`Server::tick`].
    /// `registry` is built by the caller (it is specific to whichever per-format compilers
    /// this deployment has available) and handed in already populated.
    pub fn start(config: &Config, registry: CompilerRegistry) -> Result<Self, ServerError> {
        let singleton_lock = acquire_singleton_lock(&config.compiled_record_db_path)?;

        let records = Arc::new(RecordStore::load(&config.compiled_record_db_path));
        let registry = Arc::new(registry);
        let paths = Arc::new(PathRoots::new(&config.raw_resource_path, &config.compiled_resource_path));

        let workers = WorkerPool::new(
            config.max_simultaneous_compilation_tasks,
            registry.clone(),
            records.clone(),
            paths.clone(),
            DEFAULT_WORKER_TIMEOUT,
        );

        let ipc = Arc::new(
            IpcServer::start(&config.resource_server_address, config.resource_server_port)
                .map_err(|error| ServerError::io(error, "failed to start IPC server"))?,
        );
        tracing::info!(
            address = %ipc.local_addr(),
            workers = workers.len(),
            "resource build server listening"
        );

        let mut scheduler = Scheduler::new(registry.clone(), records, paths.clone(), ipc, workers);

        let (watcher_tx, watcher_rx) = crossbeam_channel::unbounded();
        let watcher = match FileSystemWatcher::start(paths, registry, DEFAULT_DEBOUNCE, watcher_tx) {
            Ok(watcher) => {
                scheduler = scheduler.with_watcher_events(watcher_rx);
                Some(watcher)
            }
            Err(error) => {
                // §7 WatcherError: recoverable and degraded, never fatal to startup.
                tracing::warn!(%error, "failed to start file-system watcher, continuing without it");
                None
            }
        };

        Ok(Self { scheduler, watcher, _singleton_lock: singleton_lock })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn ipc_local_addr(&self) -> std::net::SocketAddr {
        self.scheduler.ipc_local_addr()
    }

    /// One iteration of the top-level tick, sleeping briefly when there is nothing to do
    /// (§5: "if there is nothing to do and no worker is busy, the outer shell sleeps 1 ms
    /// and re-ticks").
    pub fn tick(&mut self) {
        self.scheduler.tick();
        if !self.scheduler.busy_state().is_busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Runs [`Server::tick`] until `should_stop` reports true, then shuts down in order.
    pub fn run_until(&mut self, mut should_stop: impl FnMut() -> bool) {
        while !should_stop() {
            self.tick();
        }
        self.shutdown();
    }

    /// Drains in-flight work and drops the watcher. The record store is already
    /// write-through (§4.1), so there is nothing left to flush explicitly.
    pub fn shutdown(&mut self) {
        tracing::info!("shutting down: draining in-flight requests");
        self.watcher = None;
        self.scheduler.run_until_idle(Duration::from_millis(5), Some(Duration::from_secs(30)));
        tracing::info!("shutdown complete");
    }
}

/// An OS-level lock next to the record store so only one server instance runs against a
/// given database at a time (§4.11). Held for the lifetime of the returned [`File`]; the
/// lock is released automatically when it is dropped.
fn acquire_singleton_lock(record_db_path: &Path) -> Result<File, ServerError> {
    let lock_path = singleton_lock_path(record_db_path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| ServerError::io(error, "failed to create record store directory"))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|error| ServerError::io(error, "failed to open singleton lock file"))?;
    file.try_lock_exclusive().map_err(|_| ServerError::AlreadyRunning(lock_path))?;
    Ok(file)
}

fn singleton_lock_path(record_db_path: &Path) -> PathBuf {
    let mut name = record_db_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    record_db_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_lock_path_suffixes_the_db_filename() {
        let path = singleton_lock_path(Path::new("/var/db/records.json"));
        assert_eq!(path, PathBuf::from("/var/db/records.json.lock"));
    }

    #[test]
    fn acquiring_the_lock_twice_from_the_same_process_fails_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("records.json");
        let _first = acquire_singleton_lock(&db_path).unwrap();
        assert!(acquire_singleton_lock(&db_path).is_err());
    }
}
