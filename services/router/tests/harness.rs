//! Test harness for router integration tests.
//!
//! Provides a standalone worker fixture wired to socket pairs, a recording
//! protocol, and a TCP echo backend for end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use sqlmux_router::{
    CloseReason, ConnId, ConnectionError, ManualClock, Membership, Protocol, ProtocolFactory,
    Server, Service, SessionId, Worker, WorkerId,
};

// =============================================================================
// Recording protocol
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    Read,
    Hangup,
    Error,
}

/// What the test protocol observed, shared by every connection of a fixture.
pub struct Recorder {
    events: Mutex<Vec<(Seen, ConnId)>>,
    reasons: Mutex<Vec<CloseReason>>,
    pub reuse_ok: AtomicBool,
    pub reuse_calls: AtomicUsize,
    pub close_on_hangup: AtomicBool,
}

impl Recorder {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reasons: Mutex::new(Vec::new()),
            reuse_ok: AtomicBool::new(true),
            reuse_calls: AtomicUsize::new(0),
            close_on_hangup: AtomicBool::new(true),
        }
    }

    pub fn count(&self, kind: Seen, id: ConnId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(k, c)| *k == kind && *c == id)
            .count()
    }

    /// Session close reasons seen at hang-up time.
    pub fn hangup_reasons(&self) -> Vec<CloseReason> {
        self.reasons.lock().clone()
    }

    fn record(&self, kind: Seen, id: ConnId) {
        self.events.lock().push((kind, id));
    }
}

struct RecordingProtocol {
    recorder: Arc<Recorder>,
}

impl Protocol for RecordingProtocol {
    fn ready_for_reading(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        self.recorder.record(Seen::Read, id);
        let outcome = worker.read_available(id)?;
        if outcome.eof {
            worker.close(id);
        }
        Ok(())
    }

    fn error(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        self.recorder.record(Seen::Error, id);
        worker.close(id);
        Ok(())
    }

    fn hangup(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        self.recorder.record(Seen::Hangup, id);
        let reason = worker
            .connection(id)
            .and_then(|c| c.session())
            .and_then(|s| worker.session(s))
            .map(|s| s.close_reason());
        if let Some(reason) = reason {
            self.recorder.reasons.lock().push(reason);
        }
        if self.recorder.close_on_hangup.load(Ordering::SeqCst) {
            worker.close(id);
        }
        Ok(())
    }

    fn reuse_connection(&mut self, _worker: &mut Worker, _id: ConnId, _session: SessionId) -> bool {
        self.recorder.reuse_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.reuse_ok.load(Ordering::SeqCst)
    }
}

pub struct RecordingFactory {
    recorder: Arc<Recorder>,
}

impl ProtocolFactory for RecordingFactory {
    fn name(&self) -> &str {
        "recording"
    }

    fn client(&self) -> Box<dyn Protocol> {
        Box::new(RecordingProtocol {
            recorder: Arc::clone(&self.recorder),
        })
    }

    fn backend(&self) -> Box<dyn Protocol> {
        Box::new(RecordingProtocol {
            recorder: Arc::clone(&self.recorder),
        })
    }
}

// =============================================================================
// Worker fixture
// =============================================================================

pub const PERSIST_MAX_TIME: Duration = Duration::from_secs(3600);

/// A standalone worker with one service and one server. Connections are
/// socket pairs; the far ends are kept here so they stay open.
pub struct Fixture {
    pub worker: Worker,
    pub clock: Arc<ManualClock>,
    pub server: Arc<Server>,
    pub service: Arc<Service>,
    pub recorder: Arc<Recorder>,
    peers: HashMap<ConnId, UnixStream>,
}

impl Fixture {
    pub fn new(pool_max: usize) -> Self {
        Self::with_timeouts(pool_max, None, None)
    }

    pub fn with_timeouts(
        pool_max: usize,
        idle_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new());
        let worker = Worker::standalone(WorkerId::new(0), clock.clone()).unwrap();
        let recorder = Arc::new(Recorder::new());
        let server = Arc::new(
            Server::new("db1", "127.0.0.1:1".parse().unwrap()).with_pool(pool_max, PERSIST_MAX_TIME),
        );
        let service = Arc::new(
            Service::new(
                "svc",
                vec![Arc::clone(&server)],
                Arc::new(RecordingFactory {
                    recorder: Arc::clone(&recorder),
                }),
            )
            .with_idle_timeout(idle_timeout)
            .with_write_timeout(write_timeout),
        );

        Self {
            worker,
            clock,
            server,
            service,
            recorder,
            peers: HashMap::new(),
        }
    }

    /// Register a client and return it with its session.
    pub fn client(&mut self) -> (ConnId, SessionId) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let id = self
            .worker
            .adopt_client(Box::new(ours), "client".to_string(), &self.service)
            .unwrap();
        self.peers.insert(id, theirs);
        let session = self.worker.connection(id).unwrap().session().unwrap();
        (id, session)
    }

    /// Register a backend of the fixture's server for `session`.
    pub fn backend(&mut self, session: SessionId) -> ConnId {
        let server = Arc::clone(&self.server);
        self.backend_for(&server, session)
    }

    /// Register a backend of `server` for `session`.
    pub fn backend_for(&mut self, server: &Arc<Server>, session: SessionId) -> ConnId {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let id = self
            .worker
            .adopt_backend(server, session, Box::new(ours), "backend".to_string())
            .unwrap();
        self.peers.insert(id, theirs);
        id
    }

    /// Far end of a connection.
    pub fn peer(&mut self, id: ConnId) -> &mut UnixStream {
        self.peers.get_mut(&id).unwrap()
    }

    pub fn drop_peer(&mut self, id: ConnId) {
        self.peers.remove(&id);
    }

    /// Run a few non-blocking loop iterations. Freshly registered sockets
    /// report an initial write-ready edge, which this consumes.
    pub fn settle(&mut self) {
        for _ in 0..3 {
            self.worker.run_once(Some(Duration::ZERO));
        }
    }

    /// Release `backend` from `session` into the pool.
    pub fn release(&mut self, session: SessionId, backend: ConnId) {
        self.worker
            .session_mut(session)
            .unwrap()
            .set_pool_eligible(true);
        self.worker.close(backend);
    }

    pub fn membership(&self, id: ConnId) -> Option<Membership> {
        self.worker.membership(id)
    }

    pub fn pooled(&self) -> usize {
        self.worker.pool_len(&self.server)
    }

    /// Every connection is in exactly one of live, pool and zombie list.
    pub fn assert_membership_partition(&self) {
        assert_eq!(
            self.worker.live_count() + self.pooled() + self.worker.zombie_count(),
            self.worker.connection_count()
        );
    }
}

// =============================================================================
// Saturated listener
// =============================================================================

/// A listener that never accepts, with its accept queue filled so that new
/// connects to it stay pending.
pub struct SaturatedListener {
    pub addr: SocketAddr,
    _listener: Socket,
    _queued: Vec<std::net::TcpStream>,
}

impl SaturatedListener {
    pub fn bind() -> Self {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        listener.bind(&any.into()).unwrap();
        listener.listen(1).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        while queued.len() < 1024 {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(100)) {
                Ok(stream) => queued.push(stream),
                Err(_) => break,
            }
        }

        Self {
            addr,
            _listener: listener,
            _queued: queued,
        }
    }
}

// =============================================================================
// TCP echo backend
// =============================================================================

pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
