//! Error types for the routing worker core.

use std::io;

use sqlmux_poll::PollError;
use thiserror::Error;

use crate::connection::ConnId;
use crate::session::SessionId;
use crate::worker::WorkerId;

/// Errors raised while building or running the worker fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    /// A fleet needs at least one worker.
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// The shared listener set could not be created.
    #[error("could not create the shared listener set: {0}")]
    SharedSet(#[source] PollError),

    /// A worker could not be created.
    #[error("could not create worker {id}: {source}")]
    CreateWorker { id: WorkerId, source: PollError },

    /// A worker could not be started.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Registration on the shared listener set failed.
    #[error("shared listener registration failed: {0}")]
    Register(#[source] PollError),
}

/// Errors raised by an individual worker's lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `start` was called on a worker that was already started.
    #[error("worker {0} has already been started")]
    AlreadyStarted(WorkerId),

    /// The worker thread could not be spawned.
    #[error("could not spawn thread for worker {id}: {source}")]
    Spawn { id: WorkerId, source: io::Error },
}

/// Reasons a task could not be posted to a worker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    /// Checked execution was requested and the worker is not running.
    #[error("worker {0} is not running")]
    NotRunning(WorkerId),

    /// The worker could not be woken up.
    #[error("worker {0} could not be woken")]
    Wake(WorkerId),
}

/// Per-connection errors. They close the connection, never the worker.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("poll registration failed: {0}")]
    Poll(#[from] PollError),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The service has no running server to route to.
    #[error("no running server available for service {0}")]
    NoServer(String),
}
