//! Relay error taxonomy.
//!
//! Only two variants carry through `Result`s: authentication failures
//! (surfaced to the client as a generic rejection, nothing more) and
//! external-dependency failures (logged, never surfaced verbatim).
//! "Room not found" is not an error — the Room Store returns `Ok(None)`
//! and the relay signals the requesting connection. Protocol violations
//! (e.g. broadcasting into a room never joined) are silent no-ops.

use std::fmt;

#[derive(Debug)]
pub enum RelayError {
    /// Missing, malformed, expired, or badly-signed credential.
    Auth,
    /// An external collaborator (Room Store, shared stream) failed.
    Dependency(String),
}

impl RelayError {
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency(message.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "authentication failed"),
            Self::Dependency(message) => write!(f, "dependency failure: {message}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(?err, "room store request failed");
        Self::dependency("room store request failed")
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(?err, "shared stream error");
        Self::dependency("shared stream error")
    }
}
