//! Connection lifecycle on a worker: registration, I/O, close and deferred
//! destruction.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use sqlmux_poll::Interest;
use tracing::{debug, warn};

use super::Worker;
use crate::connection::{ConnId, Connection, Membership, Role, State, Stream};
use crate::error::ConnectionError;
use crate::protocol::Protocol;
use crate::server::Server;
use crate::service::Service;
use crate::session::{CloseReason, Session, SessionId};

/// Connections are edge-triggered; handlers read and write until they would
/// block.
const CONN_INTEREST: Interest = Interest::READABLE
    .add(Interest::WRITABLE)
    .add(Interest::READ_HANGUP)
    .add(Interest::EDGE);

const READ_CHUNK: usize = 16 * 1024;

/// Everything a non-blocking read pass produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    /// The peer closed its write side.
    pub eof: bool,
}

impl Worker {
    fn add_connection(
        &mut self,
        stream: Box<dyn Stream>,
        role: Role,
        session: Option<SessionId>,
        server: Option<Arc<Server>>,
        protocol: Box<dyn Protocol>,
        remote: String,
    ) -> Result<ConnId, ConnectionError> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let now = self.clock.now();

        let entry = self.conns.vacant_entry();
        let id = ConnId::new(entry.key());
        self.handle.poller().add(fd, CONN_INTEREST, id.token())?;

        entry.insert(Connection {
            id,
            role,
            stream,
            fd,
            state: State::Polling,
            owner: self.id,
            session,
            server,
            protocol: Some(protocol),
            handler: Rc::clone(&self.protocol_handler),
            last_read: now,
            last_write: now,
            writeq: Vec::new(),
            hanged_up: false,
            connecting: None,
            counted: false,
            remote,
        });
        self.live.insert(id);
        self.descriptors.opened();

        Ok(id)
    }

    /// Take ownership of an accepted TCP client.
    pub fn accept_client(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        service: &Arc<Service>,
    ) -> Result<ConnId, ConnectionError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "Could not set TCP_NODELAY on client socket");
        }
        self.adopt_client(Box::new(stream), remote.to_string(), service)
    }

    /// Register a client stream, start a session for it and run the client
    /// protocol's `init`.
    pub fn adopt_client(
        &mut self,
        stream: Box<dyn Stream>,
        remote: String,
        service: &Arc<Service>,
    ) -> Result<ConnId, ConnectionError> {
        let session_id = SessionId::next();
        let protocol = service.protocol().client();
        let id = self.add_connection(
            stream,
            Role::Client,
            Some(session_id),
            None,
            protocol,
            remote.clone(),
        )?;
        self.sessions
            .add(Session::new(session_id, Arc::clone(service), id, remote));
        self.stats.n_accept += 1;

        debug!(worker = %self.id, conn = %id, session = %session_id, service = service.name(), "Client connection registered");

        let init = self
            .with_protocol(id, |protocol, worker| protocol.init(worker, id))
            .unwrap_or(Ok(()));
        if let Err(e) = init {
            warn!(worker = %self.id, session = %session_id, error = %e, "Client session failed to start");
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.set_close_reason(CloseReason::HandleError);
            }
            self.close(id);
            return Err(e);
        }

        Ok(id)
    }

    /// Open a fresh backend connection for `session`.
    ///
    /// The connect is non-blocking. The connection is registered right away
    /// and writes queue up until the first writable event reports the
    /// outcome. A connect still pending after the server's connect timeout
    /// is failed by the timeout sweep.
    pub fn connect_backend(
        &mut self,
        server: &Arc<Server>,
        session: SessionId,
    ) -> Result<ConnId, ConnectionError> {
        let addr = server.address();
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_nonblocking(true)?;

        let in_progress = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => true,
            Err(e) => return Err(e.into()),
        };

        let stream: TcpStream = socket.into();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(server = server.name(), error = %e, "Could not set TCP_NODELAY on backend socket");
        }

        let id = self.adopt_backend(server, session, Box::new(stream), addr.to_string())?;
        if in_progress {
            let now = self.clock.now();
            if let Some(conn) = self.conns.get_mut(id.index()) {
                conn.connecting = Some(now);
            }
        }

        debug!(worker = %self.id, conn = %id, server = server.name(), session = %session, in_progress, "Backend connection opened");
        Ok(id)
    }

    /// Register an already connected backend stream for `session`.
    pub fn adopt_backend(
        &mut self,
        server: &Arc<Server>,
        session: SessionId,
        stream: Box<dyn Stream>,
        remote: String,
    ) -> Result<ConnId, ConnectionError> {
        let service = self
            .sessions
            .get(session)
            .map(|s| Arc::clone(s.service()))
            .ok_or(ConnectionError::UnknownSession(session))?;
        let protocol = service.protocol().backend();

        let id = self.add_connection(
            stream,
            Role::Backend,
            Some(session),
            Some(Arc::clone(server)),
            protocol,
            remote,
        )?;
        server.stats().connection_opened();
        if let Some(conn) = self.conns.get_mut(id.index()) {
            conn.counted = true;
        }
        if let Some(s) = self.sessions.get_mut(session) {
            s.link_backend(id);
        }

        Ok(id)
    }

    /// A backend for `session`: from this worker's pool when pooling is on
    /// and the server is up, otherwise freshly connected.
    pub fn get_backend(
        &mut self,
        server: &Arc<Server>,
        session: SessionId,
    ) -> Result<ConnId, ConnectionError> {
        if server.persistent_conns_enabled() && server.is_running() {
            if let Some(id) = self.get_from_pool(server, session) {
                return Ok(id);
            }
        }
        self.connect_backend(server, session)
    }

    /// Close a connection. Backends eligible for pooling are pooled instead.
    /// Everything else leaves the poller and becomes a zombie, destroyed at
    /// the end of the current tick.
    pub fn close(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(id.index()) else {
            return;
        };
        if conn.state == State::Disconnected {
            return;
        }
        if conn.role == Role::Backend && self.can_be_pooled(id) {
            return;
        }

        if let Err(e) = self.disable_events(id) {
            warn!(worker = %self.id, conn = %id, error = %e, "Could not remove connection from poller");
        }
        if let Some(conn) = self.conns.get_mut(id.index()) {
            conn.state = State::Disconnected;
        }
        self.live.remove(&id);
        self.zombies.push(id);
    }

    fn disable_events(&mut self, id: ConnId) -> Result<(), ConnectionError> {
        let Some(conn) = self.conns.get_mut(id.index()) else {
            return Ok(());
        };
        if conn.state != State::Polling {
            return Ok(());
        }
        conn.state = State::NoPolling;
        self.descriptors.closed();
        self.handle.poller().delete(conn.fd)?;
        Ok(())
    }

    /// Final teardown of a zombie. Destroying a client ends its session,
    /// which closes the session's backends.
    pub(super) fn destroy(&mut self, id: ConnId) {
        if !self.conns.contains(id.index()) {
            return;
        }
        let conn = self.conns.remove(id.index());

        if conn.counted {
            if let Some(server) = &conn.server {
                server.stats().add_current(-1);
            }
        }

        match (conn.role, conn.session) {
            (Role::Client, Some(session)) => self.end_session(session),
            (Role::Backend, Some(session)) => {
                if let Some(s) = self.sessions.get_mut(session) {
                    s.unlink_backend(id);
                }
            }
            _ => {}
        }

        debug!(worker = %self.id, conn = %id, role = ?conn.role, remote = %conn.remote, "Connection destroyed");
    }

    fn end_session(&mut self, id: SessionId) {
        let backends = match self.sessions.get_mut(id) {
            Some(session) => {
                session.set_stopping();
                session.backends().to_vec()
            }
            None => return,
        };

        for backend in backends {
            self.close(backend);
        }

        if let Some(session) = self.sessions.remove(id) {
            debug!(
                worker = %self.id,
                session = %id,
                remote = session.remote(),
                reason = ?session.close_reason(),
                "Session ended"
            );
        }
    }

    /// Read everything currently available without blocking.
    pub fn read_available(&mut self, id: ConnId) -> Result<ReadOutcome, ConnectionError> {
        let now = self.clock.now();
        let conn = self
            .conns
            .get_mut(id.index())
            .ok_or(ConnectionError::UnknownConnection(id))?;

        let mut buf = [0u8; READ_CHUNK];
        let mut outcome = ReadOutcome::default();
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => outcome.data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !outcome.data.is_empty() {
            conn.last_read = now;
        }
        Ok(outcome)
    }

    /// Queue `data` and write as much of the queue as the socket takes.
    pub fn write(&mut self, id: ConnId, data: &[u8]) -> Result<(), ConnectionError> {
        let now = self.clock.now();
        let conn = self
            .conns
            .get_mut(id.index())
            .ok_or(ConnectionError::UnknownConnection(id))?;

        if conn.state == State::Disconnected {
            debug!(conn = %id, bytes = data.len(), "Discarding write to closed connection");
            return Ok(());
        }
        if conn.writeq.is_empty() {
            conn.last_write = now;
        }
        conn.writeq.extend_from_slice(data);

        self.drain_writeq(id)
    }

    /// Write queued bytes until the queue is empty or the socket is full.
    pub fn drain_writeq(&mut self, id: ConnId) -> Result<(), ConnectionError> {
        let now = self.clock.now();
        let conn = self
            .conns
            .get_mut(id.index())
            .ok_or(ConnectionError::UnknownConnection(id))?;
        if conn.connecting.is_some() {
            return Ok(());
        }

        while !conn.writeq.is_empty() {
            match conn.stream.write(&conn.writeq) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    conn.writeq.drain(..n);
                    conn.last_write = now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Run `f` with the connection's protocol detached from it. Returns
    /// `None` if the connection is gone or its protocol is already in use.
    pub fn with_protocol<R, F>(&mut self, id: ConnId, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn Protocol, &mut Worker) -> R,
    {
        let mut protocol = self.conns.get_mut(id.index())?.protocol.take()?;
        let result = f(&mut *protocol, self);
        if let Some(conn) = self.conns.get_mut(id.index()) {
            if conn.protocol.is_none() {
                conn.protocol = Some(protocol);
            }
        }
        Some(result)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id.index())
    }

    /// Which container holds `id`, if it exists.
    pub fn membership(&self, id: ConnId) -> Option<Membership> {
        if self.live.contains(&id) {
            Some(Membership::Live)
        } else if self.zombies.contains(&id) {
            Some(Membership::Zombie)
        } else if self
            .pools
            .values()
            .any(|pool| pool.entries.iter().any(|e| e.conn == id))
        {
            Some(Membership::Pooled)
        } else {
            None
        }
    }

    /// Connections that exist on this worker, whatever their membership.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    pub fn live_ids(&self) -> Vec<ConnId> {
        self.live.iter().copied().collect()
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Add a session to this worker's registry. False if the id is taken.
    pub fn register_session(&mut self, session: Session) -> bool {
        self.sessions.add(session)
    }

    pub fn deregister_session(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn find_session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.ids()
    }
}
