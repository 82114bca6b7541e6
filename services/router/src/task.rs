//! Tasks executed on worker threads.

use crate::worker::Worker;

/// Work to run on a worker thread.
///
/// A task is shared (`Arc<dyn Task>`) when it is broadcast, so one instance
/// may run on several workers at once. Ownership is released when the last
/// worker is done with it.
pub trait Task: Send + Sync {
    fn execute(&self, worker: &mut Worker);
}

impl<F> Task for F
where
    F: Fn(&mut Worker) + Send + Sync,
{
    fn execute(&self, worker: &mut Worker) {
        self(worker)
    }
}

/// How `execute` treats a worker that is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// Queue the task and return. It runs once the worker gets to it, which
    /// may be never if the worker has already stopped.
    Post,
    /// Queue the task only if the worker is running; otherwise report
    /// failure. Required whenever the caller waits for completion.
    Checked,
}
