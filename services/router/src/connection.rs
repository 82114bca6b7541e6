//! Connection handles.
//!
//! A `Connection` is one socket-backed endpoint owned by exactly one worker.
//! It lives in the worker's slab arena and is addressed by `ConnId`, which
//! doubles as its epoll token.
//!
//! Lifecycle:
//!
//! ```text
//!   register ──> Polling ──close──> Disconnected (zombie) ──tick──> destroyed
//!                  │  ^
//!        pooled    │  │  reused
//!                  v  │
//!             Polling, pool member
//! ```
//!
//! While pooled a connection stays registered so that any activity on it
//! reaches the eviction handler.
//!
//! A backend connect is issued non-blocking. Until its first writable or
//! error event the connection is marked as connecting and nothing is
//! written to it.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Tick;
use crate::handler::EventHandler;
use crate::protocol::Protocol;
use crate::server::Server;
use crate::session::SessionId;
use crate::worker::WorkerId;

/// Index of a connection in its worker's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(usize);

impl ConnId {
    pub const fn new(index: usize) -> Self {
        ConnId(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub(crate) const fn token(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Registered with the worker's poller.
    Polling,
    /// Open but removed from the poller.
    NoPolling,
    /// Closed; waiting on the zombie list for destruction.
    Disconnected,
}

/// Which of the worker's containers currently holds a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Live,
    Pooled,
    Zombie,
}

/// Byte stream under a connection.
pub trait Stream: Read + Write + AsRawFd {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Pending socket error (`SO_ERROR`), cleared by the call.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl Stream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }
}

impl Stream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        UnixStream::take_error(self)
    }
}

/// A socket-backed endpoint.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) role: Role,
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) fd: RawFd,
    pub(crate) state: State,
    pub(crate) owner: WorkerId,
    pub(crate) session: Option<SessionId>,
    /// Target server, backends only.
    pub(crate) server: Option<Arc<Server>>,
    /// Taken out while one of its callbacks runs.
    pub(crate) protocol: Option<Box<dyn Protocol>>,
    /// Current readiness strategy, swapped when the connection is pooled.
    pub(crate) handler: Rc<dyn EventHandler>,
    pub(crate) last_read: Tick,
    pub(crate) last_write: Tick,
    pub(crate) writeq: Vec<u8>,
    pub(crate) hanged_up: bool,
    /// Tick at which a non-blocking connect was issued, until it resolves.
    pub(crate) connecting: Option<Tick>,
    /// Counted in the server's current-connection counter.
    pub(crate) counted: bool,
    pub(crate) remote: String,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn server(&self) -> Option<&Arc<Server>> {
        self.server.as_ref()
    }

    pub fn last_read(&self) -> Tick {
        self.last_read
    }

    pub fn last_write(&self) -> Tick {
        self.last_write
    }

    /// Bytes waiting to be written.
    pub fn writeq_len(&self) -> usize {
        self.writeq.len()
    }

    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    /// Whether a backend connect is still in progress.
    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Whether the protocol has completed its handshake. A connection whose
    /// protocol is busy in a callback reports false.
    pub fn established(&self) -> bool {
        self.protocol.as_ref().is_some_and(|p| p.established())
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler.name()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("session", &self.session)
            .field("server", &self.server.as_ref().map(|s| s.name().to_string()))
            .field("handler", &self.handler.name())
            .field("writeq_len", &self.writeq.len())
            .field("hanged_up", &self.hanged_up)
            .field("connecting", &self.connecting.is_some())
            .finish()
    }
}
