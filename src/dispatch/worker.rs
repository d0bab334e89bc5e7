//! Worker pool and per-worker request processing.
//!
//! Each worker owns a pending queue (submitters push, only the owning
//! worker claims), a duplicate-request cache, and a clone of the cache
//! client over shared structures. Workers are plain OS threads parked on a
//! condvar; shutdown closes every queue and joins.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::dupreq::DupReqCache;
use super::export::ExportTable;
use super::handlers::{HandlerTable, RequestContext};
use super::{encode_result, Authenticator, ProcResult, ProtoStatus, ReqStatus, Request,
    RpcErrorKind};
use crate::app_config::Config;
use crate::cache::gc::run_gc;
use crate::cache::{CacheClient, CacheTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub requests_between_sweeps: u32,
    pub dupreq_retention: Duration,
    pub max_concurrent_gc: usize,
    pub gc_unused_age: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            requests_between_sweeps: 1000,
            dupreq_retention: Duration::from_secs(60),
            max_concurrent_gc: 2,
            gc_unused_age: Duration::from_secs(3600),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers.count,
            queue_capacity: config.workers.queue_capacity,
            requests_between_sweeps: config.workers.requests_between_sweeps,
            dupreq_retention: config.dupreq_retention(),
            max_concurrent_gc: config.gc.max_concurrent,
            gc_unused_age: config.gc_unused_age(),
        }
    }
}

/// Admission gate bounding concurrent full-cache sweeps.
///
/// The bound check and the increment happen in one critical section, so the
/// configured maximum can never be exceeded, only undershot.
#[derive(Debug)]
pub struct GcGate {
    current: Mutex<usize>,
    max: usize,
}

impl GcGate {
    pub fn new(max: usize) -> Self {
        Self {
            current: Mutex::new(0),
            max,
        }
    }

    pub fn try_enter(&self) -> bool {
        let mut current = self.current.lock();
        if *current >= self.max {
            return false;
        }
        *current += 1;
        true
    }

    pub fn leave(&self) {
        let mut current = self.current.lock();
        *current = current.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        *self.current.lock()
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool is shutting down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Pending,
    InFlight,
    Done,
}

struct PendingSlot {
    phase: SlotPhase,
    request: Option<Request>,
}

struct QueueInner {
    slots: Vec<PendingSlot>,
    closed: bool,
}

/// One worker's pending queue. Submitters fill slots; the owning worker
/// claims them, marks them done after processing, and compacts done slots
/// during its maintenance sweep.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
}

impl RequestQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                slots: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        })
    }

    pub fn submit(&self, request: Request) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SubmitError::Closed);
        }

        let slot = PendingSlot {
            phase: SlotPhase::Pending,
            request: Some(request),
        };
        if let Some(reusable) = inner.slots.iter_mut().find(|s| s.phase == SlotPhase::Done) {
            *reusable = slot;
        } else if inner.slots.len() < self.capacity {
            inner.slots.push(slot);
        } else {
            return Err(SubmitError::QueueFull);
        }

        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Block until a pending request exists or the queue closes.
    fn claim(&self) -> Option<(usize, Request)> {
        let mut inner = self.inner.lock();
        loop {
            let pending = inner
                .slots
                .iter()
                .position(|s| s.phase == SlotPhase::Pending);
            if let Some(index) = pending {
                inner.slots[index].phase = SlotPhase::InFlight;
                match inner.slots[index].request.take() {
                    Some(request) => return Some((index, request)),
                    None => {
                        inner.slots[index].phase = SlotPhase::Done;
                        continue;
                    }
                }
            }
            if inner.closed {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    fn complete(&self, index: usize) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(index) {
            slot.phase = SlotPhase::Done;
        }
    }

    /// Compact done slots. Only the owning worker calls this, between
    /// requests, so no slot is in flight while indices shift.
    fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.slots.len();
        inner.slots.retain(|s| s.phase != SlotPhase::Done);
        before - inner.slots.len()
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.phase == SlotPhase::Pending)
            .count()
    }
}

/// Per-worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    total: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    dupreq_hits: AtomicU64,
    duplicates_discarded: AtomicU64,
    gc_passes: AtomicU64,
}

macro_rules! stat_accessors {
    ($($field:ident),* $(,)?) => {
        $(pub fn $field(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        })*
    };
}

impl WorkerStats {
    stat_accessors!(
        total,
        ok,
        failed,
        dropped,
        dupreq_hits,
        duplicates_discarded,
        gc_passes,
    );

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by every worker in the pool.
pub struct WorkerShared {
    pub table: Arc<CacheTable>,
    pub handlers: Arc<HandlerTable>,
    pub exports: Arc<ExportTable>,
    pub auth: Arc<dyn Authenticator>,
    pub gc_gate: GcGate,
    /// Transaction id each worker is currently processing; 0 means idle.
    /// Read by peers for the starvation guard, so the guard is best-effort
    /// by construction.
    pub busy_xids: Vec<AtomicU32>,
    pub config: WorkerPoolConfig,
}

struct Worker {
    index: usize,
    queue: Arc<RequestQueue>,
    dupreq: DupReqCache,
    cache: CacheClient,
    stats: Arc<WorkerStats>,
    passcounter: u32,
}

impl Worker {
    fn run(mut self, shared: Arc<WorkerShared>) {
        debug!(worker = self.index, "worker thread started");
        loop {
            let Some((slot, request)) = self.queue.claim() else {
                break;
            };

            self.process(request, &shared);
            self.queue.complete(slot);

            self.passcounter += 1;
            if self.passcounter >= shared.config.requests_between_sweeps {
                self.passcounter = 0;
                let evicted = self.dupreq.sweep(shared.config.dupreq_retention);
                let compacted = self.queue.sweep();
                trace!(
                    worker = self.index,
                    evicted,
                    compacted,
                    "maintenance sweep"
                );
            }

            if shared.gc_gate.try_enter() {
                let outcome = run_gc(&self.cache, &shared.table, shared.config.gc_unused_age);
                shared.gc_gate.leave();
                WorkerStats::bump(&self.stats.gc_passes);
                if outcome.reclaimed > 0 {
                    debug!(
                        worker = self.index,
                        reclaimed = outcome.reclaimed,
                        "gc pass reclaimed entries"
                    );
                }
            }
        }
        debug!(worker = self.index, "worker thread stopping");
    }

    fn process(&mut self, request: Request, shared: &Arc<WorkerShared>) {
        WorkerStats::bump(&self.stats.total);
        let xid = request.xid;

        // A peer already working on this xid means the client retransmitted
        // while the original is still in progress. Say nothing; the reply in
        // flight will answer both.
        if xid != 0 {
            for (peer, busy) in shared.busy_xids.iter().enumerate() {
                if peer != self.index && busy.load(Ordering::SeqCst) == xid {
                    trace!(xid, "duplicate of an in-flight request, discarding");
                    WorkerStats::bump(&self.stats.duplicates_discarded);
                    return;
                }
            }
        }

        shared.busy_xids[self.index].store(xid, Ordering::SeqCst);
        self.dispatch(request, shared);
        shared.busy_xids[self.index].store(0, Ordering::SeqCst);
    }

    fn dispatch(&mut self, request: Request, shared: &Arc<WorkerShared>) {
        let Some(desc) = shared.handlers.get(request.proc_id) else {
            warn!(proc_id = request.proc_id, "unknown procedure");
            if let Err(err) = request
                .transport
                .send_error(request.xid, RpcErrorKind::ProcedureUnavailable)
            {
                warn!(%err, "could not send procedure rejection");
            }
            WorkerStats::bump(&self.stats.failed);
            return;
        };
        let can_be_dup = desc.flags.contains(super::DispatchFlags::CAN_BE_DUP);

        if can_be_dup {
            if let Some(body) = self.dupreq.get(request.xid) {
                trace!(xid = request.xid, "replaying stored reply");
                let body = body.clone();
                if let Err(err) = request.transport.send_reply(request.xid, &body) {
                    warn!(%err, "could not replay stored reply");
                }
                WorkerStats::bump(&self.stats.dupreq_hits);
                return;
            }
        }

        let Some(export) = shared.exports.get(request.export_id) else {
            warn!(export_id = request.export_id, "request for unknown export");
            if let Err(err) = request
                .transport
                .send_error(request.xid, RpcErrorKind::AuthFailed)
            {
                warn!(%err, "could not send export rejection");
            }
            WorkerStats::bump(&self.stats.failed);
            return;
        };

        if !export.allows_client(&request.client_host) {
            // Denied hosts get silence, not an error they could probe.
            warn!(
                host = %request.client_host,
                export = %export.name,
                "client not allowed on export"
            );
            WorkerStats::bump(&self.stats.dropped);
            return;
        }

        let security = if desc.flags.contains(super::DispatchFlags::NEEDS_CRED) {
            match shared.auth.authenticate(&request.cred) {
                Ok(sec) => Some(sec),
                Err(err) => {
                    debug!(%err, "authentication failed");
                    if let Err(send_err) = request
                        .transport
                        .send_error(request.xid, RpcErrorKind::AuthFailed)
                    {
                        warn!(%send_err, "could not send auth rejection");
                    }
                    WorkerStats::bump(&self.stats.failed);
                    return;
                }
            }
        } else {
            None
        };

        let (status, result) =
            if desc.flags.contains(super::DispatchFlags::MAKES_WRITE) && export.is_read_only() {
                trace!(proc = desc.name, "write refused on read-only export");
                (ReqStatus::Ok, ProcResult::Error(ProtoStatus::ReadOnlyFs))
            } else {
                let rctx = RequestContext {
                    export,
                    security,
                    cache: &self.cache,
                    table: &shared.table,
                };
                (desc.func)(&request.args, &rctx)
            };

        match status {
            ReqStatus::Drop => {
                trace!(proc = desc.name, xid = request.xid, "dropping request");
                WorkerStats::bump(&self.stats.dropped);
            }
            ReqStatus::Ok | ReqStatus::Failed => {
                if status == ReqStatus::Failed {
                    WorkerStats::bump(&self.stats.failed);
                } else {
                    WorkerStats::bump(&self.stats.ok);
                }
                let body = encode_result(&result);
                if let Err(err) = request.transport.send_reply(request.xid, &body) {
                    // No reply made it out, so nothing worth replaying.
                    warn!(%err, xid = request.xid, "could not send reply");
                    return;
                }
                if can_be_dup {
                    if let Err(err) = self.dupreq.insert(request.xid, body) {
                        debug!(%err, "reply not stored for replay");
                    }
                }
            }
        }
    }
}

/// Fixed pool of worker threads.
pub struct WorkerPool {
    queues: Vec<Arc<RequestQueue>>,
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
    shared: Arc<WorkerShared>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn the configured number of workers over shared dispatch state.
    pub fn spawn(
        config: WorkerPoolConfig,
        cache: CacheClient,
        table: Arc<CacheTable>,
        handlers: Arc<HandlerTable>,
        exports: Arc<ExportTable>,
        auth: Arc<dyn Authenticator>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            table,
            handlers,
            exports,
            auth,
            gc_gate: GcGate::new(config.max_concurrent_gc),
            busy_xids: (0..config.workers).map(|_| AtomicU32::new(0)).collect(),
            config,
        });

        let mut queues = Vec::with_capacity(config.workers);
        let mut stats = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for index in 0..config.workers {
            let queue = RequestQueue::new(config.queue_capacity);
            let worker_stats = Arc::new(WorkerStats::default());
            let worker = Worker {
                index,
                queue: queue.clone(),
                dupreq: DupReqCache::new(),
                cache: cache.clone(),
                stats: worker_stats.clone(),
                passcounter: 0,
            };
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("metad-worker-{index}"))
                .spawn(move || worker.run(worker_shared))?;

            queues.push(queue);
            stats.push(worker_stats);
            handles.push(handle);
        }

        Ok(Self {
            queues,
            handles,
            stats,
            shared,
            next: AtomicUsize::new(0),
        })
    }

    /// Submit a request, spreading load round-robin.
    pub fn submit(&self, request: Request) -> Result<(), SubmitError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[index].submit(request)
    }

    /// Submit a request to a specific worker. Retransmissions of an xid must
    /// land on the worker that answered it for the replay cache to see them,
    /// so routing is the submitter's job.
    pub fn submit_to(&self, worker: usize, request: Request) -> Result<(), SubmitError> {
        self.queues
            .get(worker)
            .ok_or(SubmitError::Closed)?
            .submit(request)
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    pub fn worker_stats(&self, worker: usize) -> Option<Arc<WorkerStats>> {
        self.stats.get(worker).cloned()
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Close every queue and join the workers. Each worker drains the
    /// requests already pending on its queue before exiting.
    pub fn shutdown(self) {
        for queue in &self.queues {
            queue.close();
        }
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("a worker thread panicked before shutdown");
            }
        }
    }
}
