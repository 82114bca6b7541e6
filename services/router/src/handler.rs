//! Readiness handlers.
//!
//! A connection's handler decides what its readiness events mean. Live
//! connections use `ProtocolHandler`, which forwards to the connection's
//! protocol. Pooled connections use `PoolHandler`: nothing is expected on an
//! idle pooled socket, so any event evicts it.

use crate::connection::ConnId;
use crate::error::ConnectionError;
use crate::worker::Worker;

/// Readiness strategy bound to a connection.
pub trait EventHandler {
    fn name(&self) -> &'static str;

    fn ready_for_reading(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError>;

    fn write_ready(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError>;

    fn error(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError>;

    fn hangup(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError>;
}

/// Forwards events to the connection's protocol.
#[derive(Debug, Default)]
pub struct ProtocolHandler;

impl EventHandler for ProtocolHandler {
    fn name(&self) -> &'static str {
        "protocol"
    }

    fn ready_for_reading(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker
            .with_protocol(id, |protocol, worker| protocol.ready_for_reading(worker, id))
            .unwrap_or(Ok(()))
    }

    fn write_ready(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker
            .with_protocol(id, |protocol, worker| protocol.write_ready(worker, id))
            .unwrap_or(Ok(()))
    }

    fn error(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker
            .with_protocol(id, |protocol, worker| protocol.error(worker, id))
            .unwrap_or(Ok(()))
    }

    fn hangup(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker
            .with_protocol(id, |protocol, worker| protocol.hangup(worker, id))
            .unwrap_or(Ok(()))
    }
}

/// Evicts a pooled connection on any event.
#[derive(Debug, Default)]
pub struct PoolHandler;

impl EventHandler for PoolHandler {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn ready_for_reading(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.evict_connection(id);
        Ok(())
    }

    fn write_ready(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.evict_connection(id);
        Ok(())
    }

    fn error(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.evict_connection(id);
        Ok(())
    }

    fn hangup(&self, worker: &mut Worker, id: ConnId) -> Result<(), ConnectionError> {
        worker.evict_connection(id);
        Ok(())
    }
}
