//! The thread-safe side of a worker.
//!
//! A `WorkerHandle` is created by the fleet before any thread starts. It owns
//! the worker's poller, its task queue and its waker, and is the only part of
//! a worker other threads may touch.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use sqlmux_poll::{Interest, PollError, Poller, Waker};
use tracing::{debug, error, warn};

use super::{Worker, WorkerContext, WorkerId};
use crate::error::{ExecuteError, WorkerError};
use crate::semaphore::Semaphore;
use crate::shared::SharedListeners;
use crate::task::{ExecuteMode, Task};

/// Poll token of the task-queue waker.
pub(crate) const WAKER_TOKEN: u64 = u64::MAX;

/// Poll token of the nested shared listener set.
pub(crate) const SHARED_TOKEN: u64 = u64::MAX - 1;

/// A queued unit of work.
pub(crate) enum Message {
    Task {
        task: Arc<dyn Task>,
        sem: Option<Arc<Semaphore>>,
    },
    Call {
        call: Box<dyn FnOnce(&mut Worker) + Send>,
        sem: Option<Arc<Semaphore>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub struct WorkerHandle {
    id: WorkerId,
    poller: Arc<Poller>,
    waker: Waker,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    /// Guards posting against the worker's final queue drain.
    state: Mutex<RunState>,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Create the worker's poller and register its waker and the shared
    /// listener set in it.
    pub(crate) fn create(id: WorkerId, shared: &SharedListeners) -> Result<Self, PollError> {
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.add(waker.as_raw_fd(), Interest::READABLE, WAKER_TOKEN)?;
        poller.add(shared.as_raw_fd(), Interest::READABLE, SHARED_TOKEN)?;

        let (tx, rx) = crossbeam_channel::unbounded();

        debug!(worker = %id, epoll_fd = poller.as_raw_fd(), "Worker created");

        Ok(Self {
            id,
            poller: Arc::new(poller),
            waker,
            tx,
            rx,
            state: Mutex::new(RunState::Created),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Spawn the worker thread.
    pub fn start(self: &Arc<Self>, ctx: WorkerContext) -> Result<(), WorkerError> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Created {
                return Err(WorkerError::AlreadyStarted(self.id));
            }
            *state = RunState::Running;
        }

        let handle = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || {
                let mut worker = Worker::new(handle, ctx);
                worker.run();
            });

        match spawned {
            Ok(thread) => {
                *self.thread.lock() = Some(thread);
                Ok(())
            }
            Err(source) => {
                *self.state.lock() = RunState::Created;
                Err(WorkerError::Spawn {
                    id: self.id,
                    source,
                })
            }
        }
    }

    /// Ask the worker to stop. It notices at its next wake-up.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == RunState::Running {
                *state = RunState::Stopping;
            }
        }
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(worker = %self.id, error = %e, "Could not wake worker for shutdown");
        }
    }

    /// Block until the worker thread has exited.
    pub fn join(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(worker = %self.id, "Worker thread panicked");
            }
        }
        *self.state.lock() = RunState::Stopped;
    }

    /// Queue `task` for execution on this worker. If `sem` is given it is
    /// posted once the task has run.
    pub fn execute(
        &self,
        task: Arc<dyn Task>,
        sem: Option<Arc<Semaphore>>,
        mode: ExecuteMode,
    ) -> Result<(), ExecuteError> {
        self.post(Message::Task { task, sem }, mode)
    }

    /// Queue a one-shot closure for execution on this worker.
    pub fn call<F>(&self, f: F, sem: Option<Arc<Semaphore>>, mode: ExecuteMode) -> Result<(), ExecuteError>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.post(
            Message::Call {
                call: Box::new(f),
                sem,
            },
            mode,
        )
    }

    fn post(&self, msg: Message, mode: ExecuteMode) -> Result<(), ExecuteError> {
        {
            let state = self.state.lock();
            if mode == ExecuteMode::Checked && *state != RunState::Running {
                return Err(ExecuteError::NotRunning(self.id));
            }
            // The handle owns the receiver, so the channel is never closed.
            let _ = self.tx.send(msg);
        }
        self.waker.wake().map_err(|_| ExecuteError::Wake(self.id))
    }

    pub(crate) fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn receiver(&self) -> &Receiver<Message> {
        &self.rx
    }

    pub(crate) fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Called by the worker thread after its loop has ended. Taking the
    /// state lock orders this after any in-flight checked post.
    pub(crate) fn mark_stopped(&self) {
        *self.state.lock() = RunState::Stopped;
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queued", &self.rx.len())
            .finish()
    }
}
