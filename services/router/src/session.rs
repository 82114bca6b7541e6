//! Client sessions and the per-worker session registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::connection::ConnId;
use crate::service::Service;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next id. Ids are never reused within a process.
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    #[default]
    None,
    /// Idle or write timeout.
    Timeout,
    /// The client or a backend reported an error.
    HandleError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Started,
    Stopping,
}

/// A client session: one client connection plus the backend connections
/// opened on its behalf.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    service: Arc<Service>,
    client: ConnId,
    backends: Vec<ConnId>,
    state: SessionState,
    close_reason: CloseReason,
    pool_eligible: bool,
    remote: String,
}

impl Session {
    pub fn new(id: SessionId, service: Arc<Service>, client: ConnId, remote: String) -> Self {
        Self {
            id,
            service,
            client,
            backends: Vec::new(),
            state: SessionState::Started,
            close_reason: CloseReason::None,
            pool_eligible: false,
            remote,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn client(&self) -> ConnId {
        self.client
    }

    pub fn backends(&self) -> &[ConnId] {
        &self.backends
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    pub fn set_close_reason(&mut self, reason: CloseReason) {
        self.close_reason = reason;
    }

    /// Whether backend connections released by this session may be pooled.
    /// Set by the protocol layer, which knows whether the backend is in a
    /// reusable state.
    pub fn valid_for_pool(&self) -> bool {
        self.pool_eligible
    }

    pub fn set_pool_eligible(&mut self, eligible: bool) {
        self.pool_eligible = eligible;
    }

    pub(crate) fn link_backend(&mut self, id: ConnId) {
        if !self.backends.contains(&id) {
            self.backends.push(id);
        }
    }

    pub(crate) fn unlink_backend(&mut self, id: ConnId) {
        self.backends.retain(|b| *b != id);
    }

    pub(crate) fn set_stopping(&mut self) {
        self.state = SessionState::Stopping;
    }
}

/// Sessions owned by one worker.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns false if the id is already registered.
    pub fn add(&mut self, session: Session) -> bool {
        match self.sessions.entry(session.id()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}
