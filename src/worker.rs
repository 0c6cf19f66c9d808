//! The worker pool (C7): a bounded pool of worker threads, each owning at most one compiler
//! subprocess at a time.
//!
//! Every worker runs the two phases described in §4.6 on its own thread: the up-to-date
//! check (C8), and, if needed, the compile itself (subprocess spawn, output capture, exit
//! code classification). The scheduler thread never blocks on a subprocess; it only ever
//! dispatches into a worker's single-slot channel and drains finished work from the shared
//! completion channel.

use std::{
    io::Read,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{
    error::ServerError,
    evaluator::{self, UpToDateDecision},
    id::ResourceId,
    paths::PathRoots,
    record::{CompiledResourceRecord, RecordStore},
    registry::{CompilerInvocation, CompilerRegistry},
    request::{CompilationRequest, RequestStatus},
};

/// Mirrors the worker state machine in §4.6: `Idle -> Working -> Complete -> Idle`. Stored
/// as an atomic so the scheduler (or a UI) can read it without taking a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Working = 1,
    Complete = 2,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            1 => WorkerState::Working,
            2 => WorkerState::Complete,
            _ => WorkerState::Idle,
        }
    }
}

/// What a worker reports back to the scheduler once a request reaches a terminal status.
pub struct WorkerCompletion {
    pub worker_index: usize,
    pub request: CompilationRequest,
    /// The record the scheduler should `put` on success; `None` on failure or when the
    /// up-to-date check found nothing changed and the spec's optional re-stamp (§9, Open
    /// Question) is skipped.
    pub new_record: Option<(ResourceId, CompiledResourceRecord)>,
}

/// One pool slot: a dedicated thread, a single-slot dispatch channel, and an atomic status
/// flag.
pub struct Worker {
    index: usize,
    state: Arc<AtomicU8>,
    dispatch_tx: Sender<CompilationRequest>,
}

impl Worker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    /// Dispatches `request` if this worker is [`WorkerState::Idle`]. On success the worker
    /// immediately becomes [`WorkerState::Working`]; on failure `request` is handed back to
    /// the caller unchanged.
    pub fn try_dispatch(&self, request: CompilationRequest) -> Result<(), CompilationRequest> {
        if self.state() != WorkerState::Idle {
            return Err(request);
        }
        self.state.store(WorkerState::Working as u8, Ordering::Release);
        self.dispatch_tx.send(request).map_err(|e| e.0)
    }
}

/// Shared, read-only context every worker thread needs to run the up-to-date check and the
/// compile itself.
struct WorkerContext {
    registry: Arc<CompilerRegistry>,
    records: Arc<RecordStore>,
    paths: Arc<PathRoots>,
    timeout: Duration,
}

/// Bounded pool of [`Worker`]s, sized at startup from
/// `max_simultaneous_compilation_tasks` (clamped to the host's core count).
pub struct WorkerPool {
    workers: Vec<Worker>,
    completion_rx: Receiver<WorkerCompletion>,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        registry: Arc<CompilerRegistry>,
        records: Arc<RecordStore>,
        paths: Arc<PathRoots>,
        timeout: Duration,
    ) -> Self {
        let size = size.clamp(1, num_cpus::get().max(1));
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let context = Arc::new(WorkerContext { registry, records, paths, timeout });

        let workers = (0..size)
            .map(|index| {
                let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
                let (dispatch_tx, dispatch_rx) = bounded::<CompilationRequest>(1);
                let worker_state = state.clone();
                let worker_context = context.clone();
                let worker_completion_tx = completion_tx.clone();
                std::thread::Builder::new()
                    .name(format!("resource-worker-{index}"))
                    .spawn(move || {
                        run_worker_loop(
                            index,
                            dispatch_rx,
                            worker_completion_tx,
                            worker_state,
                            worker_context,
                        )
                    })
                    .expect("failed to spawn worker thread");
                Worker { index, state, dispatch_tx }
            })
            .collect();

        Self { workers, completion_rx }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn idle_worker(&self) -> Option<&Worker> {
        self.workers.iter().find(|w| w.state() == WorkerState::Idle)
    }

    pub fn working_count(&self) -> usize {
        self.workers.iter().filter(|w| w.state() == WorkerState::Working).count()
    }

    /// Drains every worker currently in [`WorkerState::Complete`], resetting each back to
    /// [`WorkerState::Idle`] as it is taken (`accept_result`, §4.6).
    pub fn drain_completed(&self) -> Vec<WorkerCompletion> {
        let mut out = Vec::new();
        while let Ok(completion) = self.completion_rx.try_recv() {
            if let Some(worker) = self.workers.get(completion.worker_index) {
                worker.state.store(WorkerState::Idle as u8, Ordering::Release);
            }
            out.push(completion);
        }
        out
    }
}

fn run_worker_loop(
    index: usize,
    dispatch_rx: Receiver<CompilationRequest>,
    completion_tx: Sender<WorkerCompletion>,
    state: Arc<AtomicU8>,
    context: Arc<WorkerContext>,
) {
    while let Ok(mut request) = dispatch_rx.recv() {
        request.begin_compiling();
        let (status, new_record) = run_request(&mut request, &context);
        request.finish(status);
        state.store(WorkerState::Complete as u8, Ordering::Release);
        let completion = WorkerCompletion { worker_index: index, request, new_record };
        if completion_tx.send(completion).is_err() {
            break;
        }
    }
}

/// Phase 1 (up-to-date check) and, if needed, phase 2 (compile) for one request. Returns the
/// terminal status to stamp and the record to persist on success.
fn run_request(
    request: &mut CompilationRequest,
    context: &WorkerContext,
) -> (RequestStatus, Option<(ResourceId, CompiledResourceRecord)>) {
    let Some(compiler) = context.registry.get(request.resource_id.resource_type()) else {
        request.append_log(&format!("no compiler for type {}", request.resource_id.resource_type()));
        return (RequestStatus::Failed, None);
    };

    if !request.requires_forced_recompilation() {
        let decision = evaluator::evaluate(
            &request.resource_id,
            &request.source_path,
            &request.destination_path,
            compiler.as_ref(),
            &context.records,
        );
        match decision {
            UpToDateDecision::UpToDate => {
                request.append_log("up to date, skipping compile");
                return (RequestStatus::SucceededUpToDate, None);
            }
            UpToDateDecision::NeedsCompile(reason) => {
                request.append_log(&format!("needs compile: {reason}"));
            }
        }
    } else {
        request.append_log("forced recompilation requested, skipping up-to-date check");
    }

    compile(request, compiler.as_ref(), context)
}

fn compile(
    request: &mut CompilationRequest,
    compiler: &dyn crate::registry::CompilerDescriptor,
    context: &WorkerContext,
) -> (RequestStatus, Option<(ResourceId, CompiledResourceRecord)>) {
    let invocation = CompilerInvocation {
        resource_type: request.resource_id.resource_type(),
        input_path: compiler.requires_input_file().then(|| request.source_path.clone()),
        output_path: request.destination_path.clone(),
        force: request.requires_forced_recompilation(),
        platform: None,
    };

    let mut child = match compiler.invoke(&invocation) {
        Ok(child) => child,
        Err(error) => {
            let err = ServerError::SubprocessSpawn { resource: request.resource_id.clone(), source: error };
            request.append_log(&err.to_string());
            return (RequestStatus::Failed, None);
        }
    };

    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if started.elapsed() > context.timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => break None,
        }
    };

    let captured_out = stdout_handle.and_then(|h| h.join().ok()).unwrap_or_default();
    let captured_err = stderr_handle.and_then(|h| h.join().ok()).unwrap_or_default();
    if !captured_out.is_empty() {
        request.append_log(&captured_out);
    }
    if !captured_err.is_empty() {
        request.append_log(&captured_err);
    }

    let Some(exit_status) = exit_status else {
        request.append_log("compiler subprocess timed out and was killed");
        return (RequestStatus::Failed, None);
    };

    let code = exit_status.code().unwrap_or(-1);
    let status = match code {
        0 => RequestStatus::Succeeded,
        1 => RequestStatus::SucceededWithWarnings,
        2 => RequestStatus::SucceededUpToDate,
        c if c >= 16 => RequestStatus::Failed,
        _ => RequestStatus::Failed,
    };

    if !status.is_success() {
        return (status, None);
    }

    let install_deps =
        compiler.enumerate_install_dependencies(&invocation).unwrap_or_default();
    let record = evaluator::record_for(
        compiler,
        &request.resource_id,
        &request.source_path,
        &request.destination_path,
        install_deps,
    )
    .ok()
    .map(|record| (request.resource_id.clone(), record));

    (status, record)
}

/// Spawns a background thread draining one pipe into a string, joined after `wait()`
/// returns so we never deadlock on a full OS pipe buffer while the subprocess is still
/// writing.
fn spawn_reader(mut pipe: impl Read + Send + 'static) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_round_trips_through_u8() {
        assert_eq!(WorkerState::from(WorkerState::Idle as u8), WorkerState::Idle);
        assert_eq!(WorkerState::from(WorkerState::Working as u8), WorkerState::Working);
        assert_eq!(WorkerState::from(WorkerState::Complete as u8), WorkerState::Complete);
    }
}
