//! Cross-thread wake-up through an eventfd.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::PollError;

/// An eventfd registered (level-triggered) in a worker's poller.
///
/// `wake` makes the descriptor readable; `drain` resets it.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> Result<Self, PollError> {
        // SAFETY: eventfd has no memory-safety preconditions.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(PollError::Waker(io::Error::last_os_error()));
        }

        // SAFETY: fd was just returned by eventfd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Signal the waker. Safe to call from any thread.
    pub fn wake(&self) -> Result<(), PollError> {
        let buf = 1u64.to_ne_bytes();
        // SAFETY: buf is 8 valid bytes, the size eventfd expects.
        let rc = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the descriptor is already readable.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(PollError::Waker(err));
        }
        Ok(())
    }

    /// Reset the waker. Returns the number of wakes since the last drain.
    pub fn drain(&self) -> Result<u64, PollError> {
        let mut buf = [0u8; 8];
        // SAFETY: buf is 8 writable bytes.
        let rc = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(PollError::Waker(err));
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
