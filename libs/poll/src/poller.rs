//! The epoll instance.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::{Events, Interest, PollError};

/// An epoll instance.
///
/// All operations take `&self`; the kernel serializes concurrent
/// `epoll_ctl` and `epoll_wait` calls on the same instance, so a `Poller`
/// may be shared between threads.
#[derive(Debug)]
pub struct Poller {
    fd: OwnedFd,
}

impl Poller {
    /// Create a new epoll instance.
    pub fn new() -> Result<Self, PollError> {
        // SAFETY: epoll_create1 has no memory-safety preconditions.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(PollError::Create(io::Error::last_os_error()));
        }

        // SAFETY: fd was just returned by epoll_create1 and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Register `fd` under `token`.
    pub fn add(&self, fd: RawFd, interest: Interest, token: u64) -> Result<(), PollError> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    /// Remove `fd` from the polling set.
    pub fn delete(&self, fd: RawFd) -> Result<(), PollError> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::EMPTY, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, token: u64) -> Result<(), PollError> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };

        // SAFETY: `event` is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(PollError::from_ctl(fd, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Wait for readiness.
    ///
    /// `None` blocks indefinitely, `Some(Duration::ZERO)` returns immediately.
    /// An interrupted wait reports zero events. Returns the number of events
    /// now held in `events`.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize, PollError> {
        events.clear();

        let capacity = events.buf.capacity();
        if capacity == 0 {
            return Err(PollError::Wait(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event buffer has no capacity",
            )));
        }

        let timeout_ms = timeout_millis(timeout);
        let max_events = capacity.min(libc::c_int::MAX as usize) as libc::c_int;

        // SAFETY: the buffer has room for `max_events` entries and the kernel
        // writes at most that many.
        let rc = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.buf.as_mut_ptr(),
                max_events,
                timeout_ms,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(PollError::Wait(err));
        }

        // SAFETY: epoll_wait initialized the first `rc` entries.
        unsafe { events.buf.set_len(rc as usize) };
        Ok(rc as usize)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Convert a timeout to epoll milliseconds, rounding sub-millisecond waits up
/// so that a short non-zero timeout never becomes a busy poll.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
