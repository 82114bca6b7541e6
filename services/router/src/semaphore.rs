//! Counting semaphore used as a rendezvous between a caller and the workers
//! executing its tasks.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A blocking counting semaphore.
///
/// Workers `post` once per completed task; the caller waits for as many
/// posts as it dispatched tasks.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    /// Block until one post is available and consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Block until `n` posts have been consumed. Returns `n`.
    pub fn wait_n(&self, n: usize) -> usize {
        for _ in 0..n {
            self.wait();
        }
        n
    }

    /// Wait for one post until `timeout` elapses. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.wait_until(deadline)
    }

    /// Wait for up to `n` posts before `timeout` elapses. Returns how many
    /// posts were consumed.
    pub fn wait_n_timeout(&self, n: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut consumed = 0;
        while consumed < n && self.wait_until(deadline) {
            consumed += 1;
        }
        consumed
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Current number of unconsumed posts.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}
