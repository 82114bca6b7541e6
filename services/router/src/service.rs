//! Services: a named set of backend servers reached through one protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::ProtocolFactory;
use crate::server::Server;

/// A routing target for client sessions.
pub struct Service {
    name: String,
    servers: Vec<Arc<Server>>,
    protocol: Arc<dyn ProtocolFactory>,
    /// Close clients that have not sent anything for this long.
    idle_timeout: Option<Duration>,
    /// Close clients whose pending writes have not drained for this long.
    write_timeout: Option<Duration>,
    rr_counter: AtomicUsize,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        servers: Vec<Arc<Server>>,
        protocol: Arc<dyn ProtocolFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            servers,
            protocol,
            idle_timeout: None,
            write_timeout: None,
            rr_counter: AtomicUsize::new(0),
        }
    }

    pub fn with_idle_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout: timeout.filter(|t| !t.is_zero()),
            ..self
        }
    }

    pub fn with_write_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            write_timeout: timeout.filter(|t| !t.is_zero()),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn protocol(&self) -> &Arc<dyn ProtocolFactory> {
        &self.protocol
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Pick a running server, round robin.
    pub fn next_server(&self) -> Option<Arc<Server>> {
        let running: Vec<&Arc<Server>> = self.servers.iter().filter(|s| s.is_running()).collect();
        if running.is_empty() {
            return None;
        }
        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % running.len();
        Some(Arc::clone(running[idx]))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("servers", &self.servers.len())
            .field("protocol", &self.protocol.name())
            .field("idle_timeout", &self.idle_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}
