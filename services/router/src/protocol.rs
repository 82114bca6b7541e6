//! Interface to the protocol layer.
//!
//! The worker core knows nothing about wire formats. Each connection carries
//! a `Protocol` object created by its service's `ProtocolFactory`; the worker
//! forwards readiness events to it and asks it two questions on behalf of the
//! pool: is the connection fully established, and can it be handed to a new
//! session.

use crate::connection::ConnId;
use crate::error::ConnectionError;
use crate::session::SessionId;
use crate::worker::Worker;

/// Per-connection protocol state machine.
///
/// Callbacks receive the owning worker and the connection id. The protocol
/// object is detached from its connection for the duration of a callback,
/// so it may freely call back into the worker. Returning an error closes
/// the connection.
pub trait Protocol {
    /// Called once after a client connection has been registered.
    fn init(&mut self, _worker: &mut Worker, _id: ConnId) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn ready_for_reading(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError>;

    fn write_ready(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.drain_writeq(id)
    }

    fn error(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.close(id);
        Ok(())
    }

    fn hangup(&mut self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.close(id);
        Ok(())
    }

    /// Whether the handshake has completed. Only established backends are
    /// pooled.
    fn established(&self) -> bool {
        true
    }

    /// Prepare a pooled backend for `session`. Returning false discards the
    /// connection.
    fn reuse_connection(&mut self, _worker: &mut Worker, _id: ConnId, _session: SessionId) -> bool {
        false
    }
}

/// Creates protocol objects for a service.
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &str;

    fn client(&self) -> Box<dyn Protocol>;

    fn backend(&self) -> Box<dyn Protocol>;
}
