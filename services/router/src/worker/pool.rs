//! Per-worker pools of idle backend connections.
//!
//! Each worker keeps one FIFO pool per server. A pooled connection stays
//! registered with the worker's poller under `PoolHandler`, so that a peer
//! close or any stray byte evicts it. The process-wide number of pooled
//! connections per server is capped by `Server::persist_pool_max`.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Worker;
use crate::clock::{ticks, Tick};
use crate::connection::{ConnId, State};
use crate::server::Server;
use crate::session::SessionId;

/// Sweep mode for `Worker::evict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evict {
    /// Drop entries that hung up, outlived the maximum age or exceed the
    /// server's capacity.
    Expired,
    /// Drop everything.
    All,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PersistentEntry {
    pub(crate) created: Tick,
    pub(crate) conn: ConnId,
}

#[derive(Debug)]
pub(crate) struct ServerPool {
    pub(crate) server: Arc<Server>,
    pub(crate) entries: VecDeque<PersistentEntry>,
}

impl ServerPool {
    fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pools are per server object, not per name: two servers may share a name.
pub(crate) fn pool_key(server: &Server) -> usize {
    server as *const Server as usize
}

impl Worker {
    /// Connections pooled for `server` on this worker.
    pub fn pool_len(&self, server: &Server) -> usize {
        self.pools.get(&pool_key(server)).map_or(0, ServerPool::len)
    }

    /// Hand a pooled connection to `session`, oldest first. Entries whose
    /// protocol refuses reuse are discarded and the next one is tried.
    pub fn get_from_pool(&mut self, server: &Arc<Server>, session: SessionId) -> Option<ConnId> {
        if !self.pools.contains_key(&pool_key(server)) {
            return None;
        }
        self.evict(server, Evict::Expired);

        loop {
            let entry = self.pools.get_mut(&pool_key(server))?.entries.pop_front()?;
            server.pool_stats().release();
            let id = entry.conn;

            let Some(conn) = self.conns.get_mut(id.index()) else {
                continue;
            };
            conn.handler = Rc::clone(&self.protocol_handler);
            conn.session = Some(session);

            let reused = self
                .with_protocol(id, |protocol, worker| {
                    protocol.reuse_connection(worker, id, session)
                })
                .unwrap_or(false);

            if !reused {
                warn!(
                    worker = %self.id,
                    server = server.name(),
                    conn = %id,
                    "Failed to reuse a pooled connection, discarding it"
                );
                self.close_pooled(id);
                continue;
            }

            if let Some(conn) = self.conns.get_mut(id.index()) {
                conn.counted = true;
            }
            server.stats().add_current(1);
            server.pool_stats().record_reuse();
            self.live.insert(id);
            if let Some(s) = self.sessions.get_mut(session) {
                s.link_backend(id);
            }

            debug!(worker = %self.id, server = server.name(), conn = %id, session = %session, "Reusing pooled connection");
            return Some(id);
        }
    }

    /// Decide whether a closing backend goes to the pool, and if so move it
    /// there. Called from `close`.
    pub(crate) fn can_be_pooled(&mut self, id: ConnId) -> bool {
        if self.evicting || self.closing {
            return false;
        }

        let Some(conn) = self.conns.get(id.index()) else {
            return false;
        };
        let Some(server) = conn.server.clone() else {
            return false;
        };
        if conn.state != State::Polling || conn.hanged_up || !conn.established() {
            return false;
        }
        // Unsent bytes belong to the ending session.
        if conn.is_connecting() || conn.writeq_len() > 0 {
            debug!(
                worker = %self.id,
                server = server.name(),
                conn = %id,
                pending = conn.writeq_len(),
                "Backend connection has pending writes, not pooling it"
            );
            return false;
        }
        let Some(session) = conn.session.and_then(|s| self.sessions.get(s)) else {
            return false;
        };
        if !session.valid_for_pool() {
            return false;
        }
        let session_id = session.id();

        let capacity = server.persist_pool_max();
        if capacity == 0 || !server.is_running() {
            return false;
        }
        if self.evict(&server, Evict::Expired) >= capacity {
            return false;
        }
        if !server.pool_stats().try_acquire(capacity) {
            return false;
        }

        let now = self.clock.now();
        let Some(conn) = self.conns.get_mut(id.index()) else {
            server.pool_stats().release();
            return false;
        };
        conn.handler = Rc::clone(&self.pool_handler);
        conn.session = None;
        if std::mem::replace(&mut conn.counted, false) {
            server.stats().add_current(-1);
        }

        if let Some(s) = self.sessions.get_mut(session_id) {
            s.unlink_backend(id);
        }
        self.live.remove(&id);
        let pool = self
            .pools
            .entry(pool_key(&server))
            .or_insert_with(|| ServerPool::new(Arc::clone(&server)));
        pool.entries.push_back(PersistentEntry { created: now, conn: id });
        server.pool_stats().record_high_water(pool.len());

        debug!(worker = %self.id, server = server.name(), conn = %id, "Backend connection pooled");
        true
    }

    /// Sweep the pool for `server` and return how many entries remain. A
    /// server that is down is always swept with `Evict::All`.
    pub fn evict(&mut self, server: &Arc<Server>, mode: Evict) -> usize {
        let now = self.clock.now();
        let mode = if server.is_running() { mode } else { Evict::All };
        let max_age = ticks(server.persist_max_time());
        let capacity = server.persist_pool_max();

        let Some(pool) = self.pools.get_mut(&pool_key(server)) else {
            return 0;
        };
        let conns = &self.conns;

        let mut evicted = Vec::new();
        let mut surplus = 0usize;
        let mut kept = 0usize;
        pool.entries.retain(|entry| {
            let hanged_up = conns
                .get(entry.conn.index())
                .map_or(true, |c| c.hanged_up);
            let too_old = now.saturating_sub(entry.created) > max_age;
            let too_many = kept >= capacity;

            if mode == Evict::All || hanged_up || too_old || too_many {
                if too_many && !hanged_up && !too_old {
                    surplus += 1;
                }
                evicted.push(entry.conn);
                false
            } else {
                kept += 1;
                true
            }
        });
        server.pool_stats().record_high_water(kept);

        if surplus > 0 && mode == Evict::Expired {
            warn!(
                worker = %self.id,
                server = server.name(),
                surplus,
                capacity,
                "Pool above capacity, closing surplus connections"
            );
        }

        for id in evicted {
            server.pool_stats().release();
            self.close_pooled(id);
        }
        kept
    }

    /// Sweep every pool on this worker.
    pub fn evict_all(&mut self, mode: Evict) {
        let servers: Vec<Arc<Server>> = self
            .pools
            .values()
            .map(|pool| Arc::clone(&pool.server))
            .collect();
        for server in servers {
            self.evict(&server, mode);
        }
    }

    /// A pooled connection saw activity. Drop it from the pool and close it.
    pub(crate) fn evict_connection(&mut self, id: ConnId) {
        let Some(server) = self.conns.get(id.index()).and_then(|c| c.server.clone()) else {
            return;
        };

        let removed = match self.pools.get_mut(&pool_key(&server)) {
            Some(pool) => {
                let before = pool.entries.len();
                pool.entries.retain(|e| e.conn != id);
                pool.entries.len() != before
            }
            None => false,
        };
        if removed {
            server.pool_stats().release();
        }

        debug!(worker = %self.id, server = server.name(), conn = %id, "Evicting pooled connection after unexpected activity");
        self.close_pooled(id);
    }

    /// Close a connection that must not go back to the pool.
    fn close_pooled(&mut self, id: ConnId) {
        let evicting = std::mem::replace(&mut self.evicting, true);
        self.close(id);
        self.evicting = evicting;
    }
}
