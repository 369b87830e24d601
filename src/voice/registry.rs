//! Live voice sessions, listed per tenant for the admin surface.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::SessionState;
use crate::models::Identity;

pub struct SessionInfo {
    id: String,
    identity: Identity,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    utterances: AtomicU64,
}

impl SessionInfo {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub(crate) fn record_utterance(&self) {
        self.utterances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            user_id: self.identity.user_id.clone(),
            state: self.state(),
            utterances: self.utterances.load(Ordering::Relaxed),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub utterances: u64,
    pub started_at: DateTime<Utc>,
}

type Sessions = DashMap<String, Arc<SessionInfo>>;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Connecting`. It is removed when the guard drops.
    pub fn register(&self, identity: Identity) -> SessionGuard {
        let info = Arc::new(SessionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Connecting),
            utterances: AtomicU64::new(0),
        });
        self.sessions.insert(info.id.clone(), Arc::clone(&info));
        SessionGuard {
            info,
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Sessions of one tenant, oldest first.
    pub fn list(&self, tenant_id: &str) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.identity.tenant_id == tenant_id)
            .map(|s| s.summary())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Keeps a session listed while alive.
pub struct SessionGuard {
    info: Arc<SessionInfo>,
    sessions: Arc<Sessions>,
}

impl SessionGuard {
    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_listed_per_tenant_and_removed_on_drop() {
        let registry = SessionRegistry::new();
        let a = registry.register(Identity::new("acme", "alice"));
        let _b = registry.register(Identity::new("globex", "bob"));

        a.info().set_state(SessionState::Active);
        a.info().record_utterance();

        let listed = registry.list("acme");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, "alice");
        assert_eq!(listed[0].state, SessionState::Active);
        assert_eq!(listed[0].utterances, 1);

        drop(a);
        assert!(registry.list("acme").is_empty());
        assert_eq!(registry.len(), 1);
    }
}
