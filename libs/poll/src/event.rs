//! Interest and readiness flags, and the event buffer.

use std::ops::BitOr;

/// Readiness kinds a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer closed its writing half.
    pub const READ_HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);
    /// Edge-triggered delivery. Without it, delivery is level-triggered.
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    pub(crate) const EMPTY: Interest = Interest(0);

    /// Raw epoll bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_edge(self) -> bool {
        self.contains(Interest::EDGE)
    }

    /// The same interest with level-triggered delivery.
    pub const fn level(self) -> Interest {
        self.remove(Interest::EDGE)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

/// Readiness reported for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u32);

impl Ready {
    /// A hang-up with nothing else set. Used for synthetic hang-ups.
    pub const HANGUP: Ready = Ready(libc::EPOLLHUP as u32);
    pub const READABLE: Ready = Ready(libc::EPOLLIN as u32);
    pub const WRITABLE: Ready = Ready(libc::EPOLLOUT as u32);
    pub const ERROR: Ready = Ready(libc::EPOLLERR as u32);

    pub const fn from_bits(bits: u32) -> Ready {
        Ready(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }

    /// Full hang-up or peer half-close.
    pub const fn is_hangup(self) -> bool {
        self.0 & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    token: u64,
    ready: Ready,
}

impl Event {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn ready(&self) -> Ready {
        self.ready
    }
}

/// Reusable buffer of events returned by `Poller::wait`.
pub struct Events {
    pub(crate) buf: Vec<libc::epoll_event>,
}

impl Events {
    /// Create a buffer that receives at most `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf.iter().map(|raw| {
            let token = raw.u64;
            let bits = raw.events;
            Event {
                token,
                ready: Ready(bits),
            }
        })
    }
}

impl Default for Events {
    /// An unallocated buffer. It must be replaced before it is waited on.
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
