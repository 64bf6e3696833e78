//! Connection gatekeeper: the IDENTIFY handshake.

use std::sync::Arc;

use crate::AppState;

use super::events::{EventName, IdentifyPayload, ServerMessage};
use super::session::SessionData;

/// Process an IDENTIFY opcode.
///
/// Consults the credential cache first and only runs cryptographic
/// verification on a miss. On success the connection is bound in the
/// session cache and registered (self-room included), and the initial
/// signals are returned for delivery before anything else: READ_ONLY
/// first when the credential is read-only, then INIT_ROOM.
///
/// The returned error strings are for logging only — the client always
/// sees the same generic rejection.
pub fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<(String, Arc<SessionData>, Vec<ServerMessage>), &'static str> {
    let token = payload.token.trim();
    if token.is_empty() {
        return Err("missing credential");
    }

    let session = match state.sessions.lookup_credential(token) {
        Some(session) => session,
        None => {
            let session = Arc::new(
                state
                    .verifier
                    .verify(token)
                    .map_err(|_| "credential rejected")?,
            );
            state.sessions.store_credential(token, session.clone());
            session
        }
    };

    let connection_id =
        drawbridge_common::id::prefixed_ulid(drawbridge_common::id::prefix::CONNECTION);
    state.sessions.bind_connection(&connection_id, session.clone());
    state
        .registry
        .register(&connection_id, &session.user_id, &session.username);

    let mut initial = Vec::new();
    if session.is_read_only() {
        initial.push(ServerMessage::dispatch(
            EventName::READ_ONLY,
            serde_json::json!({}),
        ));
    }
    initial.push(ServerMessage::dispatch(
        EventName::INIT_ROOM,
        serde_json::json!({ "connection_id": connection_id }),
    ));

    Ok((connection_id, session, initial))
}
