//! Readiness polling primitives for the routing workers.
//!
//! This library wraps the Linux `epoll` and `eventfd` interfaces:
//! - `Poller` owns an epoll instance and registers descriptors under a token
//! - `Interest` selects readiness kinds and the triggering mode
//! - `Events` is a reusable buffer filled by `Poller::wait`
//! - `Waker` interrupts a blocked `wait` from another thread
//!
//! A `Poller` is itself a pollable descriptor, so one instance can be
//! registered inside another:
//!
//! ```text
//!   worker poller ──┬── connection fds (edge-triggered)
//!                   ├── waker eventfd  (level-triggered)
//!                   └── shared poller  (level-triggered)
//!                           └── listening sockets (level-triggered)
//! ```

mod event;
mod poller;
mod waker;

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

pub use event::{Event, Events, Interest, Ready};
pub use poller::Poller;
pub use waker::Waker;

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError {
    /// The epoll instance could not be created.
    #[error("failed to create epoll instance: {0}")]
    Create(#[source] io::Error),

    /// The descriptor is already part of the polling set.
    #[error("descriptor {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },

    /// The descriptor is not part of the polling set.
    #[error("descriptor {fd} is not registered")]
    NotRegistered { fd: RawFd },

    /// The descriptor is closed or does not support polling.
    #[error("descriptor {fd} cannot be polled: {source}")]
    BadDescriptor { fd: RawFd, source: io::Error },

    /// Any other `epoll_ctl` failure (ENOMEM, ENOSPC).
    #[error("epoll_ctl failed for descriptor {fd}: {source}")]
    Control { fd: RawFd, source: io::Error },

    /// `epoll_wait` failed.
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] io::Error),

    /// The eventfd could not be created, written or read.
    #[error("eventfd failed: {0}")]
    Waker(#[source] io::Error),
}

impl PollError {
    /// Classify an `epoll_ctl` failure.
    pub(crate) fn from_ctl(fd: RawFd, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EEXIST) => PollError::AlreadyRegistered { fd },
            Some(libc::ENOENT) => PollError::NotRegistered { fd },
            Some(libc::EBADF) | Some(libc::EPERM) | Some(libc::EINVAL) => {
                PollError::BadDescriptor { fd, source }
            }
            _ => PollError::Control { fd, source },
        }
    }
}
