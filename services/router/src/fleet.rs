//! The worker fleet.
//!
//! A `Fleet` owns every worker handle plus the shared listener set. It is
//! created with `init`, started with `start_workers`, and torn down with
//! `finish`, which consumes it.
//!
//! Worker-private state is never touched from outside. Everything a caller
//! wants done on the workers goes through one of the fan-out calls:
//!
//! | call                   | waits          | mode    |
//! |------------------------|----------------|---------|
//! | `broadcast`            | caller's sem   | checked |
//! | `broadcast_disposable` | no             | post    |
//! | `broadcast_fn`         | caller's sem   | chosen  |
//! | `execute_serially`     | after each     | checked |
//! | `execute_concurrently` | after all      | checked |
//!
//! Calls that block refuse to run on a worker thread, since the worker
//! would end up waiting for itself.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sqlmux_poll::Interest;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::FleetError;
use crate::proxy::Listener;
use crate::semaphore::Semaphore;
use crate::shared::{SharedHandler, SharedListeners};
use crate::stats::{
    combined_document, thread_document, threads_document, StatKind, WorkerSnapshot,
    WorkerStatistics,
};
use crate::task::{ExecuteMode, Task};
use crate::worker::{current_id, Worker, WorkerContext, WorkerHandle, WorkerId};

/// Fleet construction parameters.
#[derive(Clone)]
pub struct FleetConfig {
    pub threads: usize,
    pub clock: Arc<dyn Clock>,
}

impl FleetConfig {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }
}

pub struct Fleet {
    workers: Vec<Arc<WorkerHandle>>,
    shared: Arc<SharedListeners>,
    clock: Arc<dyn Clock>,
    id_main: WorkerId,
    id_min: WorkerId,
    id_max: WorkerId,
    running: AtomicBool,
    rr_counter: AtomicUsize,
}

impl Fleet {
    /// Create the shared listener set and `config.threads` workers. Nothing
    /// runs until `start_workers`.
    pub fn init(config: FleetConfig) -> Result<Self, FleetError> {
        if config.threads == 0 {
            return Err(FleetError::NoWorkers);
        }

        let shared = Arc::new(SharedListeners::new().map_err(FleetError::SharedSet)?);

        let mut workers = Vec::with_capacity(config.threads);
        for i in 0..config.threads {
            let id = WorkerId::new(i);
            match WorkerHandle::create(id, &shared) {
                Ok(handle) => workers.push(Arc::new(handle)),
                Err(source) => {
                    error!(worker = %id, error = %source, "Could not create worker");
                    while let Some(created) = workers.pop() {
                        debug!(worker = %created.id(), "Tearing down partially initialized worker");
                    }
                    return Err(FleetError::CreateWorker { id, source });
                }
            }
        }

        info!(workers = config.threads, "Worker fleet initialized");

        Ok(Self {
            workers,
            shared,
            clock: config.clock,
            id_main: WorkerId::new(0),
            id_min: WorkerId::new(0),
            id_max: WorkerId::new(config.threads - 1),
            running: AtomicBool::new(false),
            rr_counter: AtomicUsize::new(0),
        })
    }

    /// Stop anything still running and destroy the workers, highest id first.
    pub fn finish(mut self) {
        self.stop();
        while let Some(worker) = self.workers.pop() {
            debug!(worker = %worker.id(), "Worker destroyed");
        }
        info!("Worker fleet finished");
    }

    fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shutdown_all();
        // A worker cannot wait for its own thread.
        if let Some(id) = current_id() {
            error!(worker = %id, "Worker fleet stopped from a worker thread, not joining");
            return;
        }
        self.join_workers();
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Start every worker. Stops at the first failure; workers already
    /// started keep running.
    pub fn start_workers(&self) -> Result<(), FleetError> {
        for worker in &self.workers {
            worker.start(self.context())?;
            self.running.store(true, Ordering::Release);
        }
        info!(workers = self.workers.len(), "Worker fleet started");
        Ok(())
    }

    /// Ask every worker to stop. Returns immediately.
    pub fn shutdown_all(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }

    /// Wait for every worker thread to exit.
    pub fn join_workers(&self) {
        for worker in &self.workers {
            worker.join();
        }
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn id_main(&self) -> WorkerId {
        self.id_main
    }

    pub fn id_min(&self) -> WorkerId {
        self.id_min
    }

    pub fn id_max(&self) -> WorkerId {
        self.id_max
    }

    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    pub fn shared(&self) -> &Arc<SharedListeners> {
        &self.shared
    }

    /// Look up a worker. `WorkerId::MAIN` resolves to the main worker.
    pub fn get(&self, id: WorkerId) -> Option<&Arc<WorkerHandle>> {
        let id = if id == WorkerId::MAIN { self.id_main } else { id };
        self.workers.get(id.index())
    }

    /// The worker running on the calling thread.
    pub fn current(&self) -> Option<&Arc<WorkerHandle>> {
        current_id().and_then(|id| self.get(id))
    }

    /// Next worker, round robin from `id_min`.
    pub fn pick_worker(&self) -> &Arc<WorkerHandle> {
        let n = self.workers.len();
        let idx = self.id_min.index() + self.rr_counter.fetch_add(1, Ordering::Relaxed) % n;
        &self.workers[idx]
    }

    // =========================================================================
    // Shared descriptors
    // =========================================================================

    /// Register a descriptor with the shared listener set, owned by the main
    /// worker.
    pub fn add_shared_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn SharedHandler>,
    ) -> Result<(), FleetError> {
        self.shared
            .add(fd, interest, handler, self.id_main)
            .map_err(FleetError::Register)
    }

    pub fn remove_shared_fd(&self, fd: RawFd) -> Result<(), FleetError> {
        self.shared.remove(fd).map_err(FleetError::Register)
    }

    /// Register a listener so that every worker accepts from it.
    pub fn add_listener(&self, listener: Arc<Listener>) -> Result<(), FleetError> {
        let fd = listener.as_raw_fd();
        self.add_shared_fd(fd, Interest::READABLE, listener)
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    fn can_block(&self, operation: &'static str) -> bool {
        match current_id() {
            Some(id) => {
                error!(worker = %id, operation, "Blocking fan-out called from a worker thread, refusing");
                false
            }
            None => true,
        }
    }

    fn post_all(&self, task: &Arc<dyn Task>, sem: Option<&Arc<Semaphore>>, mode: ExecuteMode) -> usize {
        let mut posted = 0;
        for worker in &self.workers {
            match worker.execute(Arc::clone(task), sem.cloned(), mode) {
                Ok(()) => posted += 1,
                Err(e) => warn!(worker = %worker.id(), error = %e, "Could not post task to worker"),
            }
        }
        posted
    }

    /// Post `task` to every running worker. If `sem` is given it is posted
    /// once per completed task; the return value is how many to wait for.
    pub fn broadcast(&self, task: Arc<dyn Task>, sem: Option<&Arc<Semaphore>>) -> usize {
        self.post_all(&task, sem, ExecuteMode::Checked)
    }

    /// Post `task` to every worker without checking whether it runs.
    pub fn broadcast_disposable(&self, task: Arc<dyn Task>) -> usize {
        self.post_all(&task, None, ExecuteMode::Post)
    }

    pub fn broadcast_fn<F>(&self, f: F, sem: Option<&Arc<Semaphore>>, mode: ExecuteMode) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        let task: Arc<dyn Task> = Arc::new(f);
        self.post_all(&task, sem, mode)
    }

    /// Run `task` on each worker in turn, waiting for each before posting to
    /// the next. Returns the number of workers that ran it.
    pub fn execute_serially(&self, task: Arc<dyn Task>) -> usize {
        if !self.can_block("execute_serially") {
            return 0;
        }

        let sem = Arc::new(Semaphore::new(0));
        let mut executed = 0;
        for worker in &self.workers {
            match worker.execute(Arc::clone(&task), Some(Arc::clone(&sem)), ExecuteMode::Checked) {
                Ok(()) => {
                    sem.wait();
                    executed += 1;
                }
                Err(e) => warn!(worker = %worker.id(), error = %e, "Could not post task to worker"),
            }
        }
        executed
    }

    pub fn execute_serially_fn<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        self.execute_serially(Arc::new(f))
    }

    /// Post `task` to every worker, then wait for all of them.
    pub fn execute_concurrently(&self, task: Arc<dyn Task>) -> usize {
        if !self.can_block("execute_concurrently") {
            return 0;
        }

        let sem = Arc::new(Semaphore::new(0));
        let posted = self.post_all(&task, Some(&sem), ExecuteMode::Checked);
        sem.wait_n(posted)
    }

    pub fn execute_concurrently_fn<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        self.execute_concurrently(Arc::new(f))
    }

    /// Run `f` on one worker and wait for its result.
    pub fn call<R, F>(&self, id: WorkerId, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Worker) -> R + Send + 'static,
    {
        if !self.can_block("call") {
            return None;
        }
        let worker = self.get(id)?;

        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let sem = Arc::new(Semaphore::new(0));
        worker
            .call(
                move |w| *out.lock() = Some(f(w)),
                Some(Arc::clone(&sem)),
                ExecuteMode::Checked,
            )
            .ok()?;
        sem.wait();

        let result = slot.lock().take();
        result
    }

    /// Liveness check: every running worker must run a no-op within
    /// `timeout`.
    pub fn watchdog(&self, timeout: Duration) -> bool {
        if !self.can_block("watchdog") {
            return false;
        }

        let sem = Arc::new(Semaphore::new(0));
        let noop: Arc<dyn Task> = Arc::new(|_: &mut Worker| {});
        let posted = self.post_all(&noop, Some(&sem), ExecuteMode::Checked);
        let answered = sem.wait_n_timeout(posted, timeout);

        if posted < self.workers.len() || answered < posted {
            warn!(
                workers = self.workers.len(),
                posted,
                answered,
                timeout_ms = timeout.as_millis() as u64,
                "Watchdog: not every worker responded"
            );
            return false;
        }
        true
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Snapshot of every running worker, ordered by id.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let collected = Arc::new(Mutex::new(Vec::with_capacity(self.workers.len())));
        let sink = Arc::clone(&collected);
        self.execute_concurrently_fn(move |w| sink.lock().push(w.snapshot()));

        let mut snaps = std::mem::take(&mut *collected.lock());
        snaps.sort_by_key(|s| s.id);
        snaps
    }

    pub fn worker_snapshot(&self, id: WorkerId) -> Option<WorkerSnapshot> {
        self.call(id, |w| w.snapshot())
    }

    /// Statistics combined over all workers.
    pub fn statistics(&self) -> WorkerStatistics {
        let snaps = self.snapshots();
        WorkerStatistics::aggregate(snaps.iter().map(|s| &s.stats))
    }

    pub fn one_statistic(&self, kind: StatKind) -> u64 {
        self.statistics().get(kind)
    }

    /// `threads` document listing every worker.
    pub fn list_to_json(&self, host: &str) -> Value {
        threads_document(host, &self.snapshots())
    }

    pub fn worker_to_json(&self, host: &str, id: WorkerId) -> Option<Value> {
        self.worker_snapshot(id).map(|s| thread_document(host, &s))
    }

    /// Combined view over every worker.
    pub fn statistics_to_json(&self, host: &str) -> Value {
        combined_document(host, &self.snapshots())
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("workers", &self.workers.len())
            .field("id_main", &self.id_main)
            .field("running", &self.is_running())
            .finish()
    }
}
