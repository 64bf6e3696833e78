//! Per-connection identity and authorization claims.

/// Permission level carried by a credential. The wire encoding is an
/// integer where `1` means read-only; every other value is read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn from_level(level: i64) -> Self {
        if level == 1 {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }
}

/// Decoded claims bound to a connection at handshake time.
///
/// Created once per successful authentication and never mutated; the
/// session cache drops it when the connection closes.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub user_id: String,
    pub username: String,
    /// Room id the credential was issued for.
    pub file_id: String,
    pub permission: Permission,
    /// The raw credential this session was established with.
    pub credential: String,
    /// Credential expiry (unix seconds).
    pub expires_at: i64,
}

impl SessionData {
    pub fn is_read_only(&self) -> bool {
        self.permission == Permission::ReadOnly
    }
}
