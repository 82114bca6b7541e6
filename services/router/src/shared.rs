//! The shared listener set.
//!
//! Listening sockets are not owned by any one worker. They are registered in
//! a single epoll instance that is itself nested, level-triggered, inside
//! every worker's poller. When it becomes readable, whichever workers wake up
//! each pull at most one event out of it and run the registration's handler
//! on themselves:
//!
//! ```text
//!   listener fd ──> shared poller ──┬──> worker 0 poller
//!                                   ├──> worker 1 poller
//!                                   └──> worker N poller
//! ```
//!
//! Several workers can be woken for the same event. The losers find nothing
//! to accept, which is expected and counted.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use sqlmux_poll::{Events, Interest, PollError, Poller, Ready};
use tracing::debug;

use crate::worker::{Worker, WorkerId};

/// Handler for events on a shared descriptor. Runs on whichever worker
/// picked up the event.
pub trait SharedHandler: Send + Sync {
    fn handle_event(&self, worker: &mut Worker, ready: Ready);
}

struct Registration {
    owner: WorkerId,
    handler: Arc<dyn SharedHandler>,
}

type Registrations = HashMap<RawFd, Arc<Registration>>;

pub struct SharedListeners {
    poller: Poller,
    /// Read lock-free on every shared event; replaced wholesale on change.
    registrations: ArcSwap<Registrations>,
    write_lock: Mutex<()>,
}

impl SharedListeners {
    pub fn new() -> Result<Self, PollError> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a descriptor. Shared descriptors are always level-triggered;
    /// an edge flag in `interest` is ignored.
    pub fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn SharedHandler>,
        owner: WorkerId,
    ) -> Result<(), PollError> {
        let _guard = self.write_lock.lock();

        let current = self.registrations.load();
        if current.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered { fd });
        }

        let mut next: Registrations = (**current).clone();
        next.insert(fd, Arc::new(Registration { owner, handler }));
        self.registrations.store(Arc::new(next));

        if let Err(e) = self.poller.add(fd, interest.level(), fd as u64) {
            let mut rollback: Registrations = (**self.registrations.load()).clone();
            rollback.remove(&fd);
            self.registrations.store(Arc::new(rollback));
            return Err(e);
        }

        debug!(fd, owner = %owner, "Shared descriptor registered");
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> Result<(), PollError> {
        let _guard = self.write_lock.lock();

        let current = self.registrations.load();
        if !current.contains_key(&fd) {
            return Err(PollError::NotRegistered { fd });
        }
        self.poller.delete(fd)?;

        let mut next: Registrations = (**current).clone();
        next.remove(&fd);
        self.registrations.store(Arc::new(next));

        debug!(fd, "Shared descriptor removed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.registrations.load().contains_key(&fd)
    }

    /// Worker that registered `fd`.
    pub fn owner(&self, fd: RawFd) -> Option<WorkerId> {
        self.registrations.load().get(&fd).map(|r| r.owner)
    }

    /// Take at most one ready event without blocking.
    pub(crate) fn poll_one(&self) -> Result<Option<(Arc<dyn SharedHandler>, Ready)>, PollError> {
        let mut events = Events::with_capacity(1);
        self.poller.wait(&mut events, Some(Duration::ZERO))?;

        let Some(event) = events.iter().next() else {
            return Ok(None);
        };
        let fd = event.token() as RawFd;
        let registrations = self.registrations.load();
        Ok(registrations
            .get(&fd)
            .map(|r| (Arc::clone(&r.handler), event.ready())))
    }
}

impl AsRawFd for SharedListeners {
    fn as_raw_fd(&self) -> RawFd {
        self.poller.as_raw_fd()
    }
}

impl fmt::Debug for SharedListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedListeners")
            .field("fd", &self.poller.as_raw_fd())
            .field("registrations", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl SharedHandler for Counting {
        fn handle_event(&self, _worker: &mut Worker, _ready: Ready) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let shared = SharedListeners::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        let handler = Arc::new(Counting(AtomicUsize::new(0)));

        shared
            .add(fd, Interest::READABLE, handler.clone(), WorkerId::new(0))
            .unwrap();
        let err = shared
            .add(fd, Interest::READABLE, handler, WorkerId::new(0))
            .unwrap_err();
        assert!(matches!(err, PollError::AlreadyRegistered { .. }));
        assert_eq!(shared.len(), 1);
        assert_eq!(shared.owner(fd), Some(WorkerId::new(0)));
    }

    #[test]
    fn test_remove_unknown_descriptor() {
        let shared = SharedListeners::new().unwrap();
        assert!(matches!(
            shared.remove(12345),
            Err(PollError::NotRegistered { fd: 12345 })
        ));
    }

    #[test]
    fn test_poll_one_without_activity() {
        let shared = SharedListeners::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        shared
            .add(
                listener.as_raw_fd(),
                Interest::READABLE | Interest::EDGE,
                Arc::new(Counting(AtomicUsize::new(0))),
                WorkerId::new(0),
            )
            .unwrap();
        assert!(shared.poll_one().unwrap().is_none());
    }

    #[test]
    fn test_pending_connection_reported_until_accepted() {
        let shared = SharedListeners::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        shared
            .add(
                listener.as_raw_fd(),
                Interest::READABLE | Interest::EDGE,
                Arc::new(Counting(AtomicUsize::new(0))),
                WorkerId::new(0),
            )
            .unwrap();

        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // Level-triggered even though EDGE was requested.
        let (_, ready) = shared.poll_one().unwrap().unwrap();
        assert!(ready.is_readable());
        assert!(shared.poll_one().unwrap().is_some());

        let _accepted = listener.accept().unwrap();
        assert!(shared.poll_one().unwrap().is_none());
    }
}
