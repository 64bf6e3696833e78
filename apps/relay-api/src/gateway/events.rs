//! Relay opcodes, event names, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_JOIN_ROOM: u8 = 4;
pub const OP_BROADCAST: u8 = 5;
pub const OP_VOLATILE: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    pub d: Value,
}

impl ServerMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            d: data,
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomPayload {
    pub room_id: String,
}

/// Payload for both durable and volatile broadcasts. `payload` is an
/// opaque JSON document the relay does not interpret, except to pull
/// the content delta out for persistence.
#[derive(Debug, Deserialize)]
pub struct BroadcastPayload {
    pub room_id: String,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    /// Sent once right after authentication succeeds.
    pub const INIT_ROOM: &'static str = "INIT_ROOM";
    /// Sent before anything else when the credential is read-only.
    pub const READ_ONLY: &'static str = "READ_ONLY";
    /// Authoritative snapshot, delivered to the joining connection only.
    pub const ROOM_SNAPSHOT: &'static str = "ROOM_SNAPSHOT";
    /// The Room Store knows no such room; joining connection only.
    pub const ROOM_NOT_FOUND: &'static str = "ROOM_NOT_FOUND";
    /// Freshly enumerated member list, deduplicated by user id.
    pub const PRESENCE_UPDATE: &'static str = "PRESENCE_UPDATE";
    /// Durable broadcast, payload relayed verbatim.
    pub const ROOM_BROADCAST: &'static str = "ROOM_BROADCAST";
    /// Volatile broadcast, tagged with the sender's identity.
    pub const VOLATILE_BROADCAST: &'static str = "VOLATILE_BROADCAST";
}
