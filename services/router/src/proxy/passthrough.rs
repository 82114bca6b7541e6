//! Byte relay protocol.
//!
//! The client side picks a backend when the session starts and forwards
//! everything it reads to it. The backend side forwards everything back.
//! A client that closes cleanly with nothing left in flight releases its
//! backend to the pool.

use std::sync::Arc;

use tracing::debug;

use crate::connection::ConnId;
use crate::error::ConnectionError;
use crate::protocol::{Protocol, ProtocolFactory};
use crate::session::SessionId;
use crate::worker::Worker;

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFactory;

impl ProtocolFactory for PassthroughFactory {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn client(&self) -> Box<dyn Protocol> {
        Box::new(PassthroughClient)
    }

    fn backend(&self) -> Box<dyn Protocol> {
        Box::new(PassthroughBackend)
    }
}

fn session_of(worker: &Worker, id: ConnId) -> Result<SessionId, ConnectionError> {
    worker
        .connection(id)
        .and_then(|c| c.session())
        .ok_or(ConnectionError::UnknownConnection(id))
}

#[derive(Debug, Default)]
pub struct PassthroughClient;

impl Protocol for PassthroughClient {
    fn init(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        let session = session_of(worker, id)?;
        let service = worker
            .session(session)
            .map(|s| Arc::clone(s.service()))
            .ok_or(ConnectionError::UnknownSession(session))?;
        let server = service
            .next_server()
            .ok_or_else(|| ConnectionError::NoServer(service.name().to_string()))?;

        let backend = worker.get_backend(&server, session)?;
        debug!(session = %session, server = server.name(), backend = %backend, "Session routed");
        Ok(())
    }

    fn ready_for_reading(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        let outcome = worker.read_available(id)?;
        let session = session_of(worker, id)?;
        let backends = worker
            .session(session)
            .map(|s| s.backends().to_vec())
            .unwrap_or_default();

        if !outcome.data.is_empty() {
            for backend in &backends {
                worker.write(*backend, &outcome.data)?;
            }
        }

        if outcome.eof {
            let drained = backends
                .iter()
                .all(|b| worker.connection(*b).is_some_and(|c| c.writeq_len() == 0));
            if let Some(s) = worker.session_mut(session) {
                s.set_pool_eligible(drained);
            }
            worker.close(id);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PassthroughBackend;

impl PassthroughBackend {
    fn close_session(worker: &mut Worker, id: ConnId) {
        let client = worker
            .connection(id)
            .and_then(|c| c.session())
            .and_then(|s| worker.session(s))
            .map(|s| s.client());
        worker.close(id);
        if let Some(client) = client {
            worker.close(client);
        }
    }
}

impl Protocol for PassthroughBackend {
    fn ready_for_reading(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        let outcome = worker.read_available(id)?;
        let client = worker
            .connection(id)
            .and_then(|c| c.session())
            .and_then(|s| worker.session(s))
            .map(|s| s.client());

        if let Some(client) = client {
            if !outcome.data.is_empty() {
                if let Err(e) = worker.write(client, &outcome.data) {
                    debug!(conn = %client, error = %e, "Write to client failed");
                    worker.close(client);
                }
            }
        }

        if outcome.eof {
            Self::close_session(worker, id);
        }
        Ok(())
    }

    /// Also reached when a connect fails or times out.
    fn error(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        Self::close_session(worker, id);
        Ok(())
    }

    fn hangup(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        Self::close_session(worker, id);
        Ok(())
    }

    fn reuse_connection(&mut self, _worker: &mut Worker, _id: ConnId, _session: SessionId) -> bool {
        true
    }
}
