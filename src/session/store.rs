//! In-memory session store.
//!
//! Sessions are keyed by an unguessable id and bound to the device
//! fingerprint presented at completion time. Reads slide the idle window;
//! a periodic sweep evicts sessions idle past the configured TTL.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, info};

use crate::security::random_token;

/// One authenticated session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub object_id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub roles: BTreeSet<String>,
    pub tenant_id: Option<String>,
    /// Durable credential-cache handle for this user.
    pub user_identifier: Option<String>,
    /// Device fingerprint the session is bound to.
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Identity data a new session is created from.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub object_id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub roles: BTreeSet<String>,
    pub tenant_id: Option<String>,
    pub user_identifier: Option<String>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionRecord>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session bound to `fingerprint` and return its record.
    pub fn create(&self, identity: SessionIdentity, fingerprint: String) -> SessionRecord {
        // Collisions over 43 random chars are not a practical concern,
        // but looping keeps the store correct regardless.
        loop {
            let session_id = random_token();
            let entry = self.sessions.entry(session_id.clone());
            if let Entry::Vacant(vacant) = entry {
                let now = Utc::now();
                let record = SessionRecord {
                    session_id,
                    object_id: identity.object_id,
                    email: identity.email,
                    username: identity.username,
                    roles: identity.roles,
                    tenant_id: identity.tenant_id,
                    user_identifier: identity.user_identifier,
                    fingerprint,
                    created_at: now,
                    last_seen_at: now,
                };
                vacant.insert(record.clone());
                info!(email = ?record.email, "Session created");
                return record;
            }
        }
    }

    /// Look up a session, sliding its idle window.
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let mut entry = self.sessions.get_mut(session_id)?;
        entry.last_seen_at = Utc::now();
        Some(entry.clone())
    }

    /// Look up a session without touching its idle window.
    pub fn peek(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn delete(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.remove(session_id).map(|(_, record)| record)
    }

    /// Delete every session bound to `fingerprint`; returns the count.
    pub fn delete_by_fingerprint(&self, fingerprint: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.session_id.clone())
            .collect();
        for id in &ids {
            self.sessions.remove(id);
        }
        ids.len()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let mut all: Vec<SessionRecord> =
            self.sessions.iter().map(|entry| entry.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Sessions belonging to the user with `object_id`.
    pub fn list_for_user(&self, object_id: &str) -> Vec<SessionRecord> {
        let mut mine: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|entry| entry.object_id.as_deref() == Some(object_id))
            .map(|entry| entry.clone())
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        mine
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict sessions idle longer than `ttl`; returns the eviction count.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_seen_at < cutoff)
            .map(|entry| entry.session_id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if self.sessions.remove(&id).is_some() {
                debug!(session_id = %id, "Swept idle session");
            }
        }
        count
    }
}
