//! The scheduler / orchestrator (C9): the central state machine. Accepts requests,
//! deduplicates, picks workers, drives the pending -> active -> completed pipeline,
//! notifies clients, and persists records.
//!
//! Everything here runs on a single thread (the "tick thread", §5); parallelism comes
//! entirely from the worker pool and the IO threads feeding the lock-free queues this
//! module drains each [`Scheduler::tick`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::{
    id::ResourceId,
    ipc::{message::WireStatus, IpcServer, Message},
    packaging::PackagingSession,
    paths::PathRoots,
    record::RecordStore,
    registry::CompilerRegistry,
    request::{CompilationRequest, RequestOrigin, RequestStatus},
    worker::WorkerPool,
};

/// Default backpressure watermark suggested by §9: past this many pending requests, new
/// `RequestResource` submissions are rejected outright.
pub const DEFAULT_PENDING_WATERMARK: usize = 10_000;

/// How many terminal requests the `completed` list retains for UI-visible history (§4.8
/// step 6).
pub const DEFAULT_COMPLETED_HISTORY: usize = 1_000;

/// Tracks the extra listeners (and, when applicable, an upgraded originating client) that
/// arrived for a resource while its build was already active on a worker thread. The worker
/// owns the [`CompilationRequest`] by value for the duration of the build, so these arrive
/// out-of-band and are merged back in when the completion is drained.
#[derive(Default)]
struct ActiveOverride {
    upgraded_client: Option<u32>,
    extra_listeners: Vec<u32>,
}

/// A snapshot of the counts §4.8 step 7 exposes to the outer shell / a UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyState {
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: usize,
    pub is_busy: bool,
}

pub struct Scheduler {
    registry: Arc<CompilerRegistry>,
    records: Arc<RecordStore>,
    paths: Arc<PathRoots>,
    ipc: Arc<IpcServer>,
    workers: WorkerPool,
    watcher_events: Option<Receiver<ResourceId>>,

    pending: VecDeque<CompilationRequest>,
    pending_ids: HashSet<ResourceId>,
    active_ids: HashSet<ResourceId>,
    active_overrides: HashMap<ResourceId, Arc<Mutex<ActiveOverride>>>,
    completed: VecDeque<CompilationRequest>,
    completed_history: usize,
    pending_watermark: usize,

    packaging: Option<PackagingSession>,

    next_sequence: u64,
}

impl Scheduler {
    pub fn new(
        registry: Arc<CompilerRegistry>,
        records: Arc<RecordStore>,
        paths: Arc<PathRoots>,
        ipc: Arc<IpcServer>,
        workers: WorkerPool,
    ) -> Self {
        Self {
            registry,
            records,
            paths,
            ipc,
            workers,
            watcher_events: None,
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            active_ids: HashSet::new(),
            active_overrides: HashMap::new(),
            completed: VecDeque::new(),
            completed_history: DEFAULT_COMPLETED_HISTORY,
            pending_watermark: DEFAULT_PENDING_WATERMARK,
            packaging: None,
            next_sequence: 1,
        }
    }

    pub fn with_watcher_events(mut self, events: Receiver<ResourceId>) -> Self {
        self.watcher_events = Some(events);
        self
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Creates (or dedups against) a request for `resource_id`. This is the single entry
    /// point every request source (IPC, watcher, packaging) funnels through (§4.8).
    pub fn create_request(&mut self, resource_id: ResourceId, client_id: u32, origin: RequestOrigin) {
        if !self.registry.contains(resource_id.resource_type()) {
            self.reject_immediately(
                resource_id,
                client_id,
                origin,
                format!("no compiler for type {}", resource_id.resource_type()),
            );
            return;
        }

        if self.pending.len() >= self.pending_watermark {
            self.reject_immediately(resource_id, client_id, origin, "backpressure".to_string());
            return;
        }

        if self.dedup_pending(&resource_id, client_id, origin) {
            return;
        }
        if self.dedup_active(&resource_id, client_id, origin) {
            return;
        }

        let sequence = self.next_sequence();
        let source_path = self.paths.to_raw(resource_id.path());
        let destination_path = self.paths.to_compiled(resource_id.path());
        let request = CompilationRequest::new(
            sequence,
            resource_id.clone(),
            client_id,
            origin,
            source_path,
            destination_path,
            String::new(),
        );
        self.pending_ids.insert(resource_id);
        self.pending.push_back(request);
    }

    /// Matches §4.8's dedup rules against a request still sitting in `pending`.
    fn dedup_pending(&mut self, resource_id: &ResourceId, client_id: u32, origin: RequestOrigin) -> bool {
        if !self.pending_ids.contains(resource_id) {
            return false;
        }
        let Some(existing) = self.pending.iter_mut().find(|r| &r.resource_id == resource_id) else {
            return false;
        };
        apply_dedup(existing, client_id, origin);
        true
    }

    /// Matches §4.8's dedup rules against a request currently on a worker thread. The
    /// request itself is inaccessible until the worker completes, so the update is staged
    /// in `active_overrides` and merged in during [`Scheduler::drain_completed_workers`].
    fn dedup_active(&mut self, resource_id: &ResourceId, client_id: u32, origin: RequestOrigin) -> bool {
        if !self.active_ids.contains(resource_id) {
            return false;
        }
        let overrides = self.active_overrides.entry(resource_id.clone()).or_default();
        let mut overrides = overrides.lock();
        if client_id != 0 {
            if origin == RequestOrigin::External {
                overrides.upgraded_client = Some(client_id);
            } else if !overrides.extra_listeners.contains(&client_id) {
                overrides.extra_listeners.push(client_id);
            }
        }
        true
    }

    fn reject_immediately(
        &mut self,
        resource_id: ResourceId,
        client_id: u32,
        origin: RequestOrigin,
        reason: String,
    ) {
        let sequence = self.next_sequence();
        let source_path = self.paths.to_raw(resource_id.path());
        let destination_path = self.paths.to_compiled(resource_id.path());
        let mut request = CompilationRequest::new(
            sequence,
            resource_id,
            client_id,
            origin,
            source_path,
            destination_path,
            String::new(),
        );
        request.append_log(&reason);
        request.finish_without_compiling(RequestStatus::Failed);
        tracing::debug!(resource = %request.resource_id, %reason, "request rejected immediately");
        self.notify_terminal(&request);
        if let Some(session) = &mut self.packaging {
            session.mark_completed(&request.resource_id);
        }
        self.completed.push_back(request);
    }

    /// One tick of the scheduler: ingest, drain, dispatch, advance packaging, trim history.
    /// Never blocks; the caller sleeps when [`Scheduler::busy_state`] reports nothing to do.
    pub fn tick(&mut self) {
        self.ingest_inbound();
        self.ingest_watcher_events();
        self.drain_completed_workers();
        self.dispatch_pending();
        self.advance_packaging();
        self.trim_completed_history();
    }

    fn ingest_inbound(&mut self) {
        for inbound in self.ipc.drain_inbound() {
            if let Message::RequestResource(resource_id) = inbound.message {
                self.create_request(resource_id, inbound.client_id, RequestOrigin::External);
            }
        }
    }

    fn ingest_watcher_events(&mut self) {
        let Some(events) = &self.watcher_events else { return };
        let ids: Vec<ResourceId> = events.try_iter().collect();
        for id in ids {
            self.create_request(id, 0, RequestOrigin::FileWatcher);
        }
    }

    fn drain_completed_workers(&mut self) {
        for completion in self.workers.drain_completed() {
            let mut request = completion.request;
            self.active_ids.remove(&request.resource_id);

            if let Some(overrides) = self.active_overrides.remove(&request.resource_id) {
                let overrides = overrides.lock();
                if let Some(client) = overrides.upgraded_client {
                    request.client_id = client;
                }
                for listener in &overrides.extra_listeners {
                    request.add_listener(*listener);
                }
            }

            if let Some((id, record)) = completion.new_record {
                if let Err(error) = self.records.put(id, record) {
                    tracing::warn!(%error, "failed to persist record store");
                }
            }

            self.notify_terminal(&request);

            if request.origin == RequestOrigin::FileWatcher && request.status().is_success() {
                self.ipc.broadcast(&Message::ResourceUpdated(request.resource_id.clone()));
            }

            if request.origin == RequestOrigin::Package {
                if let Some(session) = &mut self.packaging {
                    session.mark_completed(&request.resource_id);
                }
            }

            self.completed.push_back(request);
        }
    }

    fn notify_terminal(&self, request: &CompilationRequest) {
        let Some(wire_status) = WireStatus::from_request_status(request.status()) else { return };
        let message = Message::ResourceRequestComplete {
            resource_id: request.resource_id.clone(),
            status: wire_status,
            compiled_path: request.destination_path.to_string_lossy().to_string(),
        };
        for target in request.notification_targets() {
            self.ipc.send(target, &message);
        }
    }

    fn dispatch_pending(&mut self) {
        while let Some(worker) = self.workers.idle_worker() {
            let Some(request) = self.pending.pop_front() else { break };
            self.pending_ids.remove(&request.resource_id);
            self.active_ids.insert(request.resource_id.clone());
            if let Err(request) = worker.try_dispatch(request) {
                // Raced with another dispatch for this slot; put it back at the front and
                // try a different worker next time round.
                self.active_ids.remove(&request.resource_id);
                self.pending_ids.insert(request.resource_id.clone());
                self.pending.push_front(request);
                break;
            }
        }
    }

    fn advance_packaging(&mut self) {
        let Some(session) = &self.packaging else { return };
        if !session.is_packaging() {
            return;
        }
        let to_submit: Vec<ResourceId> = session
            .resources_to_package()
            .iter()
            .filter(|id| {
                !session.is_completed(id)
                    && !self.pending_ids.contains(*id)
                    && !self.active_ids.contains(*id)
            })
            .cloned()
            .collect();
        for id in to_submit {
            self.create_request(id, 0, RequestOrigin::Package);
        }
    }

    fn trim_completed_history(&mut self) {
        while self.completed.len() > self.completed_history {
            self.completed.pop_front();
        }
    }

    /// Starts a packaging sweep over the install-closure of `maps`. Precondition (§4.10):
    /// no packaging session is currently active.
    pub fn start_packaging(&mut self, maps: Vec<ResourceId>) -> bool {
        if self.packaging.as_ref().is_some_and(PackagingSession::is_packaging) {
            return false;
        }
        if maps.is_empty() {
            return false;
        }
        self.packaging = Some(PackagingSession::expand(maps, &self.registry, &self.paths));
        true
    }

    pub fn packaging_progress(&self) -> Option<f64> {
        self.packaging.as_ref().map(PackagingSession::progress)
    }

    pub fn is_packaging(&self) -> bool {
        self.packaging.as_ref().is_some_and(PackagingSession::is_packaging)
    }

    pub fn busy_state(&self) -> BusyState {
        let pending_count = self.pending.len();
        let active_count = self.active_ids.len();
        BusyState {
            pending_count,
            active_count,
            completed_count: self.completed.len(),
            is_busy: pending_count + active_count > 0,
        }
    }

    pub fn completed(&self) -> &VecDeque<CompilationRequest> {
        &self.completed
    }

    /// The address clients should connect to, e.g. for tests that bind to port 0 and need to
    /// discover what the OS actually assigned.
    pub fn ipc_local_addr(&self) -> std::net::SocketAddr {
        self.ipc.local_addr()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn working_worker_count(&self) -> usize {
        self.workers.working_count()
    }

    /// Blocks the calling thread until every currently pending/active request has reached a
    /// terminal status, polling [`Scheduler::tick`] with a short sleep when idle — used by
    /// the one-shot `--package` CLI mode and by tests. `poll_interval` mirrors the "sleep 1ms
    /// and re-tick" idle behavior described in §5.
    pub fn run_until_idle(&mut self, poll_interval: Duration, deadline: Option<Duration>) {
        let start = std::time::Instant::now();
        loop {
            self.tick();
            let busy = self.busy_state();
            let packaging_active = self.is_packaging();
            if !busy.is_busy && !packaging_active {
                return;
            }
            if let Some(deadline) = deadline {
                if start.elapsed() > deadline {
                    tracing::warn!("run_until_idle timed out while requests were still in flight");
                    return;
                }
            }
            std::thread::sleep(poll_interval);
        }
    }
}

/// Applies the existing-request half of §4.8's dedup rules, shared by the pending-list and
/// active-override code paths.
fn apply_dedup(existing: &mut CompilationRequest, client_id: u32, new_origin: RequestOrigin) {
    if existing.is_internal() && new_origin == RequestOrigin::External {
        existing.client_id = client_id;
    } else {
        existing.add_listener(client_id);
    }
    if new_origin.forces_recompile() && !existing.requires_forced_recompilation() {
        existing.force_recompilation();
    }
}
