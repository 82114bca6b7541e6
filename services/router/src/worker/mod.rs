//! The routing worker: one event reactor per thread.
//!
//! Each worker owns:
//! - a private poller holding its connections, its task waker and the
//!   shared listener set
//! - a slab arena of connections plus the live set, the per-server pools and
//!   the zombie list (every connection is in exactly one of the three)
//! - a session registry
//! - statistics and load measurements
//!
//! ## Loop
//!
//! ```text
//!   ┌──────────────┐   events   ┌──────────────────────────────────────────┐
//!   │ epoll_wait   │ ─────────> │ waker   -> run queued tasks               │
//!   │ (<= 1 tick)  │            │ shared  -> accept on one listener         │
//!   └──────────────┘            │ conn    -> handler (protocol or pool)     │
//!          ^                    └──────────────────────────────────────────┘
//!          │                                       │
//!          └──────── tick: timeouts, zombies, tick callbacks <──┘
//! ```
//!
//! Nothing in here is shared with other threads. Other threads reach a worker
//! only by posting tasks through its `WorkerHandle`.

mod connections;
mod handle;
mod pool;

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use slab::Slab;
use sqlmux_poll::{Events, Ready};
use tracing::{debug, error, info, warn};

use crate::clock::{ticks, Clock, Tick, TICK, TICKS_PER_SECOND};
use crate::connection::{ConnId, Connection, Role, State};
use crate::error::{ConnectionError, FleetError};
use crate::handler::{EventHandler, PoolHandler, ProtocolHandler};
use crate::load::WorkerLoad;
use crate::session::{CloseReason, SessionRegistry};
use crate::shared::SharedListeners;
use crate::stats::{Descriptors, WorkerSnapshot, WorkerStatistics};

pub use connections::ReadOutcome;
pub(crate) use handle::{Message, SHARED_TOKEN, WAKER_TOKEN};
pub use handle::{RunState, WorkerHandle};
pub use pool::Evict;
use pool::ServerPool;

/// Maximum events handled per poll.
pub const MAX_EVENTS: usize = 1000;

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Id of the worker running on this thread, if any.
pub fn current_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get())
}

/// Dense worker identifier. Ids start at 0 and are never reused within a
/// fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Alias resolved by `Fleet::get` to the main worker.
    pub const MAIN: WorkerId = WorkerId(usize::MAX);

    pub const fn new(index: usize) -> Self {
        WorkerId(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == WorkerId::MAIN {
            write!(f, "main")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Shared resources handed to a worker when it starts.
#[derive(Clone)]
pub struct WorkerContext {
    pub shared: Arc<SharedListeners>,
    pub clock: Arc<dyn Clock>,
}

type TickFn = Box<dyn FnMut(&mut Worker)>;

/// Worker-private state. Lives on the worker's own thread.
pub struct Worker {
    id: WorkerId,
    handle: Arc<WorkerHandle>,
    shared: Arc<SharedListeners>,
    clock: Arc<dyn Clock>,
    conns: Slab<Connection>,
    live: HashSet<ConnId>,
    zombies: Vec<ConnId>,
    /// Keyed by server identity, see `pool::pool_key`.
    pools: HashMap<usize, ServerPool>,
    sessions: SessionRegistry,
    /// Set while pooled connections are being closed, so they are not
    /// pooled again.
    evicting: bool,
    /// Set while the worker closes everything on its way out.
    closing: bool,
    next_timeout_check: Tick,
    tick_fns: Vec<TickFn>,
    stats: WorkerStatistics,
    load: WorkerLoad,
    descriptors: Descriptors,
    events: Events,
    protocol_handler: Rc<dyn EventHandler>,
    pool_handler: Rc<dyn EventHandler>,
}

impl Worker {
    pub(crate) fn new(handle: Arc<WorkerHandle>, ctx: WorkerContext) -> Self {
        let now = ctx.clock.now();
        Self {
            id: handle.id(),
            handle,
            shared: ctx.shared,
            clock: ctx.clock,
            conns: Slab::new(),
            live: HashSet::new(),
            zombies: Vec::new(),
            pools: HashMap::new(),
            sessions: SessionRegistry::new(),
            evicting: false,
            closing: false,
            next_timeout_check: now,
            tick_fns: Vec::new(),
            stats: WorkerStatistics::default(),
            load: WorkerLoad::new(Instant::now()),
            descriptors: Descriptors::default(),
            events: Events::with_capacity(MAX_EVENTS),
            protocol_handler: Rc::new(ProtocolHandler),
            pool_handler: Rc::new(PoolHandler),
        }
    }

    /// A worker driven by the calling thread instead of its own. It has a
    /// private shared listener set; call `run_once` to make progress.
    pub fn standalone(id: WorkerId, clock: Arc<dyn Clock>) -> Result<Self, FleetError> {
        let shared = Arc::new(SharedListeners::new().map_err(FleetError::SharedSet)?);
        let handle = WorkerHandle::create(id, &shared)
            .map_err(|source| FleetError::CreateWorker { id, source })?;
        Ok(Self::new(Arc::new(handle), WorkerContext { shared, clock }))
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn shared(&self) -> &Arc<SharedListeners> {
        &self.shared
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn statistics(&self) -> &WorkerStatistics {
        &self.stats
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            stats: self.stats.clone(),
            current_descriptors: self.descriptors.current,
            total_descriptors: self.descriptors.total,
            load: self.load.snapshot(),
            sessions: self.sessions.len(),
            connections: self.live.len(),
            pooled: self.pools.values().map(|p| p.len()).sum(),
            zombies: self.zombies.len(),
        }
    }

    // =========================================================================
    // Loop
    // =========================================================================

    pub(crate) fn run(&mut self) {
        self.pre_run();
        info!(worker = %self.id, "Routing worker started");

        while !self.handle.should_shutdown() {
            self.run_once(Some(TICK));
        }

        self.post_run();
        info!(worker = %self.id, "Routing worker stopped");
    }

    fn pre_run(&mut self) {
        CURRENT_WORKER.with(|c| c.set(Some(self.id)));
    }

    fn post_run(&mut self) {
        self.evict_all(Evict::All);

        self.closing = true;
        let live: Vec<ConnId> = self.live.iter().copied().collect();
        for id in live {
            self.close(id);
        }
        self.delete_zombies();
        self.closing = false;

        // Checked posts are refused from here on; run whatever got in before.
        self.handle.mark_stopped();
        self.handle_messages();

        CURRENT_WORKER.with(|c| c.set(None));
    }

    /// Wait for events for at most `timeout`, handle them, then run one tick.
    pub fn run_once(&mut self, timeout: Option<Duration>) {
        let mut events = std::mem::take(&mut self.events);

        self.load.about_to_wait(Instant::now());
        let result = self.handle.poller().wait(&mut events, timeout);
        let polled_at = Instant::now();
        self.load.about_to_work(polled_at);

        match result {
            Ok(n) => self.stats.record_poll(n),
            Err(e) => error!(worker = %self.id, error = %e, "Polling failed"),
        }

        for event in events.iter() {
            let started = Instant::now();
            self.stats.record_queue_time(started.saturating_duration_since(polled_at));

            match event.token() {
                WAKER_TOKEN => self.handle_messages(),
                SHARED_TOKEN => self.handle_shared_event(),
                token => self.dispatch(ConnId::new(token as usize), event.ready()),
            }

            self.stats.record_exec_time(started.elapsed());
        }

        self.events = events;
        self.tick();
    }

    fn handle_messages(&mut self) {
        if let Err(e) = self.handle.waker().drain() {
            warn!(worker = %self.id, error = %e, "Could not reset worker waker");
        }

        while let Ok(msg) = self.handle.receiver().try_recv() {
            match msg {
                Message::Task { task, sem } => {
                    task.execute(self);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                }
                Message::Call { call, sem } => {
                    call(self);
                    if let Some(sem) = sem {
                        sem.post();
                    }
                }
            }
        }
    }

    /// Take exactly one event off the shared listener set.
    fn handle_shared_event(&mut self) {
        match self.shared.poll_one() {
            Ok(Some((handler, ready))) => handler.handle_event(self, ready),
            Ok(None) => debug!(worker = %self.id, "No shared event left for this worker"),
            Err(e) => error!(worker = %self.id, error = %e, "Polling the shared listener set failed"),
        }
    }

    /// Handler currently bound to `id`, if it is still polling.
    fn polling_handler(&self, id: ConnId) -> Option<Rc<dyn EventHandler>> {
        match self.conns.get(id.index()) {
            Some(conn) if conn.state == State::Polling => Some(Rc::clone(&conn.handler)),
            _ => None,
        }
    }

    /// Deliver readiness to a connection: write, read, error, hang-up. Each
    /// step only runs while the connection is still polling.
    pub(crate) fn dispatch(&mut self, id: ConnId, ready: Ready) {
        if self.polling_handler(id).is_none() {
            debug!(worker = %self.id, conn = %id, "Event for a connection that is no longer polling");
            return;
        }

        let connecting = self
            .conns
            .get(id.index())
            .is_some_and(|c| c.connecting.is_some());
        let ready = if connecting {
            match self.complete_connect(id, ready) {
                Some(ready) => ready,
                None => return,
            }
        } else {
            ready
        };

        if ready.is_writable() {
            if let Some(handler) = self.polling_handler(id) {
                self.stats.n_write += 1;
                let result = handler.write_ready(self, id);
                self.handler_result(id, result);
            }
        }

        if ready.is_readable() {
            if let Some(handler) = self.polling_handler(id) {
                self.stats.n_read += 1;
                let result = handler.ready_for_reading(self, id);
                self.handler_result(id, result);
            }
        }

        if ready.is_error() {
            if let Some(handler) = self.polling_handler(id) {
                self.stats.n_error += 1;
                let result = handler.error(self, id);
                self.handler_result(id, result);
            }
        }

        if ready.is_hangup() {
            if let Some(handler) = self.polling_handler(id) {
                self.stats.n_hup += 1;
                if let Some(conn) = self.conns.get_mut(id.index()) {
                    conn.hanged_up = true;
                }
                let result = handler.hangup(self, id);
                self.handler_result(id, result);
            }
        }
    }

    /// Resolve a pending non-blocking connect from its first event. Returns
    /// the readiness to deliver, `Ready::ERROR` alone if the connect failed,
    /// or `None` if the event says nothing about the connect yet.
    fn complete_connect(&mut self, id: ConnId, ready: Ready) -> Option<Ready> {
        if !(ready.is_writable() || ready.is_error() || ready.is_hangup()) {
            return None;
        }
        let conn = self.conns.get(id.index())?;

        let failure = match conn.stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e.to_string()),
            Ok(None) if ready.is_error() || ready.is_hangup() => {
                Some("connection closed while connecting".to_string())
            }
            Ok(None) => None,
        };

        match failure {
            None => {
                debug!(worker = %self.id, conn = %id, remote = %conn.remote, "Backend connect completed");
                if let Some(conn) = self.conns.get_mut(id.index()) {
                    conn.connecting = None;
                }
                Some(ready)
            }
            Some(error) => {
                warn!(worker = %self.id, conn = %id, remote = %conn.remote, error = %error, "Backend connect failed");
                self.fail_connect(id, CloseReason::HandleError);
                Some(Ready::ERROR)
            }
        }
    }

    /// A connect that never completed leaves nothing to reuse.
    fn fail_connect(&mut self, id: ConnId, reason: CloseReason) {
        if let Some(conn) = self.conns.get_mut(id.index()) {
            conn.connecting = None;
            conn.hanged_up = true;
        }
        self.set_close_reason(id, reason);
    }

    fn handler_result(&mut self, id: ConnId, result: Result<(), ConnectionError>) {
        if let Err(e) = result {
            warn!(worker = %self.id, conn = %id, error = %e, "Connection handler failed, closing connection");
            self.set_close_reason(id, CloseReason::HandleError);
            self.close(id);
        }
    }

    /// Record why the session owning `id` is ending.
    fn set_close_reason(&mut self, id: ConnId, reason: CloseReason) {
        if let Some(session) = self.conns.get(id.index()).and_then(|c| c.session) {
            if let Some(session) = self.sessions.get_mut(session) {
                session.set_close_reason(reason);
            }
        }
    }

    /// Deliver a hang-up that did not come from the socket.
    pub fn trigger_hangup(&mut self, id: ConnId) {
        self.dispatch(id, Ready::HANGUP);
    }

    // =========================================================================
    // Tick
    // =========================================================================

    fn tick(&mut self) {
        self.process_timeouts();
        self.delete_zombies();
        self.run_tick_fns();
    }

    /// Register a callback run at the end of every loop iteration.
    pub fn register_tick_fn<F>(&mut self, f: F)
    where
        F: FnMut(&mut Worker) + 'static,
    {
        self.tick_fns.push(Box::new(f));
    }

    fn run_tick_fns(&mut self) {
        if self.tick_fns.is_empty() {
            return;
        }
        let mut fns = std::mem::take(&mut self.tick_fns);
        for f in fns.iter_mut() {
            f(self);
        }
        // Keep anything registered from inside a callback.
        fns.append(&mut self.tick_fns);
        self.tick_fns = fns;
    }

    /// Synthesize hang-ups for idle clients and clients whose writes have
    /// stalled, and fail backend connects that have not completed in time.
    /// Runs at most once per second.
    fn process_timeouts(&mut self) {
        let now = self.clock.now();
        if now < self.next_timeout_check {
            return;
        }
        self.next_timeout_check = now + TICKS_PER_SECOND;

        let mut expired = Vec::new();
        let mut stalled_connects = Vec::new();
        for &id in &self.live {
            let Some(conn) = self.conns.get(id.index()) else {
                continue;
            };
            if conn.state != State::Polling {
                continue;
            }
            if let (Some(started), Some(server)) = (conn.connecting, &conn.server) {
                let waited = now.saturating_sub(started);
                if waited > ticks(server.connect_timeout()) {
                    warn!(
                        worker = %self.id,
                        conn = %id,
                        server = server.name(),
                        timeout_ms = server.connect_timeout().as_millis() as u64,
                        "Backend connect timed out"
                    );
                    stalled_connects.push(id);
                }
                continue;
            }
            if conn.role != Role::Client || conn.hanged_up {
                continue;
            }
            let Some(session) = conn.session.and_then(|s| self.sessions.get(s)) else {
                continue;
            };
            let service = session.service();

            if let Some(timeout) = service.idle_timeout() {
                let idle = now.saturating_sub(conn.last_read);
                if idle > ticks(timeout) {
                    warn!(
                        worker = %self.id,
                        session = %session.id(),
                        remote = %conn.remote,
                        idle_secs = idle / TICKS_PER_SECOND,
                        "Timing out idle client connection"
                    );
                    expired.push((id, session.id()));
                    continue;
                }
            }

            if let Some(timeout) = service.write_timeout() {
                let stalled = now.saturating_sub(conn.last_write);
                if conn.writeq_len() > 0 && stalled > ticks(timeout) {
                    warn!(
                        worker = %self.id,
                        session = %session.id(),
                        remote = %conn.remote,
                        pending_bytes = conn.writeq_len(),
                        stalled_secs = stalled / TICKS_PER_SECOND,
                        "Network write timed out"
                    );
                    expired.push((id, session.id()));
                }
            }
        }

        for (id, session) in expired {
            if let Some(session) = self.sessions.get_mut(session) {
                session.set_close_reason(CloseReason::Timeout);
            }
            self.trigger_hangup(id);
        }

        for id in stalled_connects {
            self.fail_connect(id, CloseReason::Timeout);
            self.dispatch(id, Ready::ERROR);
        }
    }

    /// Destroy closed connections. Destroying one may close others, so this
    /// loops until the list stays empty.
    fn delete_zombies(&mut self) {
        while let Some(id) = self.zombies.pop() {
            self.destroy(id);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("connections", &self.live.len())
            .field("pooled", &self.pools.values().map(|p| p.len()).sum::<usize>())
            .field("zombies", &self.zombies.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::semaphore::Semaphore;
    use crate::task::ExecuteMode;
    use std::cell::RefCell;

    fn worker() -> (Worker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let worker = Worker::standalone(WorkerId::new(0), clock.clone()).unwrap();
        (worker, clock)
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "3");
        assert_eq!(WorkerId::MAIN.to_string(), "main");
    }

    #[test]
    fn test_current_id_unset_outside_workers() {
        assert_eq!(current_id(), None);
    }

    #[test]
    fn test_queued_call_runs_on_next_iteration() {
        let (mut worker, _clock) = worker();
        let sem = Arc::new(Semaphore::new(0));

        worker
            .handle()
            .call(
                |w| w.register_tick_fn(|_| {}),
                Some(Arc::clone(&sem)),
                ExecuteMode::Post,
            )
            .unwrap();
        assert_eq!(sem.available(), 0);

        worker.run_once(Some(Duration::ZERO));
        assert_eq!(sem.available(), 1);
        assert_eq!(worker.tick_fns.len(), 1);
    }

    #[test]
    fn test_checked_call_refused_when_not_running() {
        let (worker, _clock) = worker();
        let err = worker
            .handle()
            .call(|_| {}, None, ExecuteMode::Checked)
            .unwrap_err();
        assert_eq!(err, crate::error::ExecuteError::NotRunning(WorkerId::new(0)));
    }

    #[test]
    fn test_tick_fns_run_every_iteration() {
        let (mut worker, _clock) = worker();
        let count = Rc::new(RefCell::new(0));
        let seen = Rc::clone(&count);
        worker.register_tick_fn(move |_| *seen.borrow_mut() += 1);

        worker.run_once(Some(Duration::ZERO));
        worker.run_once(Some(Duration::ZERO));
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn test_session_helpers() {
        use crate::connection::ConnId;
        use crate::proxy::PassthroughFactory;
        use crate::service::Service;
        use crate::session::{Session, SessionId};

        let (mut worker, _clock) = worker();
        let service = Arc::new(Service::new("svc", Vec::new(), Arc::new(PassthroughFactory)));
        let id = SessionId::next();

        assert!(worker.register_session(Session::new(id, Arc::clone(&service), ConnId::new(0), String::new())));
        assert!(!worker.register_session(Session::new(id, service, ConnId::new(1), String::new())));
        assert_eq!(worker.find_session(id).map(|s| s.client()), Some(ConnId::new(0)));
        assert_eq!(worker.session_ids(), vec![id]);

        assert!(worker.deregister_session(id).is_some());
        assert!(worker.find_session(id).is_none());
        assert_eq!(worker.snapshot().sessions, 0);
    }

    #[test]
    fn test_poll_statistics_recorded() {
        let (mut worker, _clock) = worker();
        worker.run_once(Some(Duration::ZERO));
        worker.run_once(Some(Duration::ZERO));
        assert_eq!(worker.statistics().n_polls, 2);
        assert_eq!(worker.statistics().n_pollev, 0);
    }
}
