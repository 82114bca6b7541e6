//! TCP listener served from the shared listener set.
//!
//! The socket is level-triggered in the shared set and accepts one
//! connection per event. Whichever worker accepts owns the client from then
//! on.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlmux_poll::Ready;
use tracing::{debug, error, info, warn};

use crate::service::Service;
use crate::shared::SharedHandler;
use crate::worker::Worker;

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Connections accepted.
    pub accepted: AtomicU64,
    /// Wake-ups where another worker had already taken the connection.
    pub would_block: AtomicU64,
    /// `accept` failures other than would-block.
    pub failed: AtomicU64,
}

impl ListenerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn would_block(&self) -> u64 {
        self.would_block.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    service: Arc<Service>,
    stats: ListenerStats,
}

impl Listener {
    /// Bind a non-blocking listener for `service`.
    pub fn bind(addr: SocketAddr, service: Arc<Service>) -> io::Result<Self> {
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        info!(bind_addr = %local_addr, service = service.name(), "Listener bound");

        Ok(Self {
            socket,
            local_addr,
            service,
            stats: ListenerStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }
}

impl SharedHandler for Listener {
    fn handle_event(&self, worker: &mut Worker, ready: Ready) {
        if ready.is_error() {
            warn!(worker = %worker.id(), bind_addr = %self.local_addr, "Error condition on listening socket");
        }

        match self.socket.accept() {
            Ok((stream, remote)) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %worker.id(), remote = %remote, "Accepted client connection");
                if let Err(e) = worker.accept_client(stream, remote, &self.service) {
                    warn!(worker = %worker.id(), remote = %remote, error = %e, "Failed to set up client connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.would_block.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %worker.id(), bind_addr = %self.local_addr, "Connection already accepted by another worker");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = %worker.id(), bind_addr = %self.local_addr, error = %e, "Failed to accept connection");
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("service", &self.service.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::proxy::PassthroughFactory;
    use crate::worker::WorkerId;

    fn listener() -> Listener {
        let service = Arc::new(Service::new("svc", Vec::new(), Arc::new(PassthroughFactory)));
        Listener::bind("127.0.0.1:0".parse().unwrap(), service).unwrap()
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let l = listener();
        assert_ne!(l.local_addr().port(), 0);
    }

    #[test]
    fn test_accept_race_is_counted() {
        let l = listener();
        let mut worker = Worker::standalone(WorkerId::new(0), Arc::new(ManualClock::new())).unwrap();

        l.handle_event(&mut worker, Ready::READABLE);
        assert_eq!(l.stats().would_block(), 1);
        assert_eq!(l.stats().accepted(), 0);
        assert_eq!(l.stats().failed(), 0);
    }
}
