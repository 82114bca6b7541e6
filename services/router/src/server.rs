//! Backend server definitions and their process-wide pool counters.
//!
//! A `Server` is shared by every worker (`Arc<Server>`). Each worker keeps
//! its own pool of idle connections to it, but the pool capacity is a
//! process-wide ceiling enforced through `PoolStats::try_acquire`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default maximum age of a pooled connection.
pub const DEFAULT_PERSIST_MAX_TIME: Duration = Duration::from_secs(3600);

/// Process-wide pool accounting for one server.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Pooled connections across all workers.
    n_persistent: AtomicI64,
    /// Connections handed out from a pool.
    n_from_pool: AtomicU64,
    /// Largest pool size observed on any worker after a sweep.
    persistmax: AtomicI64,
}

impl PoolStats {
    /// Increment the pooled-connection counter unless it would exceed `limit`.
    pub fn try_acquire(&self, limit: usize) -> bool {
        let limit = limit as i64;
        let mut current = self.n_persistent.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.n_persistent.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release a slot taken by `try_acquire`.
    pub fn release(&self) {
        self.n_persistent.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_reuse(&self) {
        self.n_from_pool.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_high_water(&self, count: usize) {
        self.persistmax.fetch_max(count as i64, Ordering::Relaxed);
    }

    pub fn n_persistent(&self) -> i64 {
        self.n_persistent.load(Ordering::Acquire)
    }

    pub fn n_from_pool(&self) -> u64 {
        self.n_from_pool.load(Ordering::Relaxed)
    }

    pub fn persistmax(&self) -> i64 {
        self.persistmax.load(Ordering::Relaxed)
    }
}

/// Connection counters for one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Live (non-pooled) backend connections.
    n_current: AtomicI64,
    /// Backend connections ever opened.
    n_connections: AtomicU64,
}

impl ServerStats {
    pub fn n_current(&self) -> i64 {
        self.n_current.load(Ordering::Relaxed)
    }

    pub fn n_connections(&self) -> u64 {
        self.n_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.n_connections.fetch_add(1, Ordering::Relaxed);
        self.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_current(&self, delta: i64) {
        self.n_current.fetch_add(delta, Ordering::Relaxed);
    }
}

/// A backend database server.
#[derive(Debug)]
pub struct Server {
    name: String,
    address: SocketAddr,
    running: AtomicBool,
    /// Pool capacity; 0 disables pooling.
    persist_pool_max: AtomicUsize,
    persist_max_time: Duration,
    connect_timeout: Duration,
    pool_stats: PoolStats,
    stats: ServerStats,
}

impl Server {
    /// Create a running server with pooling disabled.
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
            running: AtomicBool::new(true),
            persist_pool_max: AtomicUsize::new(0),
            persist_max_time: DEFAULT_PERSIST_MAX_TIME,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_stats: PoolStats::default(),
            stats: ServerStats::default(),
        }
    }

    /// Enable pooling with the given capacity and entry max age.
    pub fn with_pool(self, persist_pool_max: usize, persist_max_time: Duration) -> Self {
        self.persist_pool_max
            .store(persist_pool_max, Ordering::Relaxed);
        Self {
            persist_max_time,
            ..self
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark the server up or down. A down server's pooled connections are
    /// flushed by the next sweep on each worker.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn persist_pool_max(&self) -> usize {
        self.persist_pool_max.load(Ordering::Relaxed)
    }

    /// Change the pool capacity at runtime. Pools above the new capacity are
    /// trimmed by the next sweep.
    pub fn set_persist_pool_max(&self, max: usize) {
        self.persist_pool_max.store(max, Ordering::Relaxed);
    }

    pub fn persistent_conns_enabled(&self) -> bool {
        self.persist_pool_max() > 0
    }

    pub fn persist_max_time(&self) -> Duration {
        self.persist_max_time
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn pool_stats(&self) -> &PoolStats {
        &self.pool_stats
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            name: self.name.clone(),
            address: self.address.to_string(),
            running: self.is_running(),
            persist_pool_max: self.persist_pool_max(),
            n_persistent: self.pool_stats.n_persistent(),
            n_from_pool: self.pool_stats.n_from_pool(),
            persistmax: self.pool_stats.persistmax(),
            n_current: self.stats.n_current(),
            n_connections: self.stats.n_connections(),
        }
    }
}

/// Serializable view of a server's counters.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub address: String,
    pub running: bool,
    pub persist_pool_max: usize,
    pub n_persistent: i64,
    pub n_from_pool: u64,
    pub persistmax: i64,
    pub n_current: i64,
    pub n_connections: u64,
}
