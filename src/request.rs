//! The compilation request (C6): the scheduler's record of one unit of work, from the
//! moment a client or the watcher asks for a resource until it reaches a terminal status.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::id::ResourceId;

/// Where a request came from. Determines whether it is internal (§3: `IsInternal ⇔ origin ≠
/// External`) and whether it forces a real compile rather than allowing an up-to-date
/// short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    External,
    ManualCompile,
    ManualCompileForced,
    FileWatcher,
    Package,
}

impl RequestOrigin {
    pub fn is_internal(self) -> bool {
        !matches!(self, RequestOrigin::External)
    }

    /// `RequiresForcedRecompilation ⇔ origin ∈ {ManualCompileForced, Package}` (§3).
    pub fn forces_recompile(self) -> bool {
        matches!(self, RequestOrigin::ManualCompileForced | RequestOrigin::Package)
    }
}

/// Terminal and non-terminal statuses a [`CompilationRequest`] passes through. Ordered
/// `Pending < Compiling < {terminal}`; the terminal variants are not ordered against each
/// other since a request only ever reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    Compiling,
    Succeeded,
    SucceededWithWarnings,
    SucceededUpToDate,
    Failed,
}

impl RequestStatus {
    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Compiling => 1,
            _ => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            RequestStatus::Succeeded
                | RequestStatus::SucceededWithWarnings
                | RequestStatus::SucceededUpToDate
        )
    }
}

/// One unit of work tracked by the scheduler. Timing fields follow §4.5:
/// `GetCompilationElapsedTime` is 0 while [`RequestStatus::Pending`], live while
/// [`RequestStatus::Compiling`], and fixed once terminal.
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    /// Monotonically increasing, scheduler-assigned; used only for internal bookkeeping
    /// (never sent over the wire).
    pub sequence: u64,
    pub resource_id: ResourceId,
    pub client_id: u32,
    pub origin: RequestOrigin,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub compiler_args: String,
    pub extra_info: String,
    status: RequestStatus,
    force_recompile: bool,
    time_requested: Instant,
    compilation_started: Option<Instant>,
    compilation_finished: Option<Instant>,
    log: String,
    /// Additional clients whose stream should also see this request's completion, attached
    /// when a duplicate submission arrives while this one is still in flight (§4.8 dedup).
    listeners: Vec<u32>,
}

impl CompilationRequest {
    pub fn new(
        sequence: u64,
        resource_id: ResourceId,
        client_id: u32,
        origin: RequestOrigin,
        source_path: PathBuf,
        destination_path: PathBuf,
        compiler_args: String,
    ) -> Self {
        let force_recompile = origin.forces_recompile();
        Self {
            sequence,
            resource_id,
            client_id,
            origin,
            source_path,
            destination_path,
            compiler_args,
            extra_info: String::new(),
            status: RequestStatus::Pending,
            force_recompile,
            time_requested: Instant::now(),
            compilation_started: None,
            compilation_finished: None,
            log: String::new(),
            listeners: Vec::new(),
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_internal(&self) -> bool {
        self.origin.is_internal()
    }

    pub fn requires_forced_recompilation(&self) -> bool {
        self.force_recompile
    }

    /// Upgrades this request to a forced recompile, used when a duplicate
    /// `ManualCompileForced` submission arrives while this one is still pending (§4.8).
    pub fn force_recompilation(&mut self) {
        self.force_recompile = true;
    }

    pub fn add_listener(&mut self, client_id: u32) {
        if client_id != 0 && client_id != self.client_id && !self.listeners.contains(&client_id) {
            self.listeners.push(client_id);
        }
    }

    /// All clients that should be notified on completion: the originator plus any listeners
    /// attached via dedup.
    pub fn notification_targets(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.client_id)
            .filter(|&id| id != 0)
            .chain(self.listeners.iter().copied())
    }

    /// `Pending -> Compiling`. Stamps `compilation_started`.
    pub fn begin_compiling(&mut self) {
        debug_assert_eq!(self.status, RequestStatus::Pending, "double transition to Compiling");
        self.status = RequestStatus::Compiling;
        self.compilation_started = Some(Instant::now());
    }

    /// `Compiling -> {terminal}`. `status` must be a terminal variant. Stamps
    /// `compilation_finished`.
    pub fn finish(&mut self, status: RequestStatus) {
        debug_assert!(status.is_terminal(), "finish() requires a terminal status");
        self.status = status;
        self.compilation_finished = Some(Instant::now());
    }

    /// Short-circuits a request straight to a terminal status without ever entering
    /// `Compiling` (used for the up-to-date fast path and for rejected requests).
    pub fn finish_without_compiling(&mut self, status: RequestStatus) {
        debug_assert!(status.is_terminal(), "finish_without_compiling() requires a terminal status");
        self.status = status;
        self.compilation_finished = Some(Instant::now());
    }

    pub fn append_log(&mut self, text: &str) {
        debug_assert!(!self.status.is_terminal(), "log is append-only until terminal");
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(text);
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    /// 0 while Pending, live elapsed while Compiling, fixed final elapsed once terminal.
    pub fn elapsed(&self) -> Duration {
        match (self.compilation_started, self.compilation_finished) {
            (None, _) => Duration::ZERO,
            (Some(started), None) => started.elapsed(),
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
        }
    }

    pub fn time_requested(&self) -> Instant {
        self.time_requested
    }
}
