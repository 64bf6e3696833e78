//! Process-local session cache.
//!
//! Two independent mappings: raw credential → verified claims (skips
//! cryptographic verification on reconnects that reuse a credential),
//! and live connection id → claims (consulted by every relay operation
//! after the handshake). Both are O(1) and safe under concurrent
//! access; entries live until overwritten or the owning connection
//! closes.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::gateway::session::SessionData;

pub struct SessionCache {
    by_credential: DashMap<String, Arc<SessionData>>,
    by_connection: DashMap<String, Arc<SessionData>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            by_credential: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Look up previously-verified claims for a raw credential.
    ///
    /// A hit whose expiry has passed is evicted and reported as a miss,
    /// so an expired-but-previously-seen credential is never accepted
    /// from cache. The caller re-verifies and gets the rejection.
    pub fn lookup_credential(&self, credential: &str) -> Option<Arc<SessionData>> {
        let hit = self.by_credential.get(credential)?.value().clone();
        if hit.expires_at <= Utc::now().timestamp() {
            self.by_credential.remove(credential);
            return None;
        }
        Some(hit)
    }

    /// Record verified claims for a credential, superseding any
    /// previous entry.
    pub fn store_credential(&self, credential: &str, session: Arc<SessionData>) {
        self.by_credential
            .insert(credential.to_string(), session);
    }

    /// Bind a connection id to its session once the handshake succeeds.
    pub fn bind_connection(&self, connection_id: &str, session: Arc<SessionData>) {
        self.by_connection
            .insert(connection_id.to_string(), session);
    }

    /// Claims for a live connection, if it completed the handshake.
    pub fn session_for(&self, connection_id: &str) -> Option<Arc<SessionData>> {
        self.by_connection
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop the connection mapping when the connection closes. The
    /// credential mapping survives for reconnects.
    pub fn unbind_connection(&self, connection_id: &str) {
        self.by_connection.remove(connection_id);
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
