//! Broadcast relay: join, durable/volatile broadcast, and disconnect.
//!
//! Per connection, after authentication: `Idle -> (N×) JoinedRoom ->
//! Disconnecting -> Disconnected`. Membership lists sent to clients are
//! always a fresh enumeration at the moment of the triggering event;
//! there is no global ordering across concurrent joins and leaves.

use std::sync::Arc;

use serde_json::Value;

use crate::AppState;

use super::events::EventName;
use super::fanout::RelayFrame;
use super::registry::{dedup_by_user, member_user_ids, RoomMember};
use super::session::SessionData;

/// Join a room: refresh the authoritative snapshot for the joining
/// connection, then tell everyone else who is present now.
pub async fn handle_join(
    state: &AppState,
    connection_id: &str,
    session: &Arc<SessionData>,
    room_id: &str,
) {
    if room_id == connection_id {
        // The self-room exists implicitly; an explicit join is meaningless.
        return;
    }

    let newly_joined = state.registry.join(connection_id, room_id);
    if newly_joined {
        let member = RoomMember {
            connection_id: connection_id.to_string(),
            user_id: session.user_id.clone(),
            username: session.username.clone(),
        };
        state.fanout.announce_join(room_id, &member).await;
    }

    let members = dedup_by_user(state.fanout.room_members(room_id));
    let member_ids = member_user_ids(&members);

    match state
        .store
        .sync_room_data(room_id, None, member_ids, None, Some(&session.credential))
        .await
    {
        Ok(Some(snapshot)) => {
            // The snapshot goes to the joining connection alone, via its
            // self-room.
            state.fanout.publish_local(RelayFrame {
                room_id: connection_id.to_string(),
                event_name: EventName::ROOM_SNAPSHOT.to_string(),
                data: serde_json::to_value(&snapshot).unwrap_or(Value::Null),
                exclude: None,
            });

            state
                .fanout
                .publish(RelayFrame {
                    room_id: room_id.to_string(),
                    event_name: EventName::PRESENCE_UPDATE.to_string(),
                    data: presence_payload(room_id, &members),
                    exclude: Some(connection_id.to_string()),
                })
                .await;
        }
        Ok(None) => {
            state.fanout.publish_local(RelayFrame {
                room_id: connection_id.to_string(),
                event_name: EventName::ROOM_NOT_FOUND.to_string(),
                data: serde_json::json!({ "room_id": room_id }),
                exclude: None,
            });
        }
        Err(err) => {
            // Never surfaced to the client; the join stays in place.
            tracing::error!(%room_id, ?err, "room store sync failed on join");
        }
    }
}

/// Durable broadcast: relay the payload verbatim to the rest of the
/// room, then hand the content delta to the Room Store in the
/// background.
pub async fn handle_broadcast(
    state: &AppState,
    connection_id: &str,
    session: &Arc<SessionData>,
    room_id: &str,
    payload: Value,
) {
    if session.is_read_only() || !state.registry.is_member(connection_id, room_id) {
        // Protocol violation — drop it without disturbing anyone.
        tracing::debug!(%connection_id, %room_id, "ignoring durable broadcast from non-writer");
        return;
    }

    state
        .fanout
        .publish(RelayFrame {
            room_id: room_id.to_string(),
            event_name: EventName::ROOM_BROADCAST.to_string(),
            data: payload.clone(),
            exclude: Some(connection_id.to_string()),
        })
        .await;

    // Persistence is independent of the relay: spawned, never awaited by
    // this connection's loop, failures only logged.
    let Some(elements) = payload.get("elements").cloned() else {
        tracing::debug!(%room_id, "broadcast payload carries no elements, skipping persistence");
        return;
    };

    let members = dedup_by_user(state.fanout.room_members(room_id));
    let member_ids = member_user_ids(&members);
    let store = state.store.clone();
    let session = session.clone();
    let room = room_id.to_string();
    tokio::spawn(async move {
        if let Err(err) = store
            .sync_room_data(
                &room,
                Some(elements),
                member_ids,
                Some(&session.user_id),
                Some(&session.credential),
            )
            .await
        {
            tracing::error!(%room, ?err, "room store persistence failed");
        }
    });
}

/// Volatile broadcast: best-effort, tagged with the sender's identity,
/// never persisted, never acknowledged.
pub async fn handle_volatile(
    state: &AppState,
    connection_id: &str,
    session: &Arc<SessionData>,
    room_id: &str,
    payload: Value,
) {
    if session.is_read_only() || !state.registry.is_member(connection_id, room_id) {
        return;
    }

    state
        .fanout
        .publish(RelayFrame {
            room_id: room_id.to_string(),
            event_name: EventName::VOLATILE_BROADCAST.to_string(),
            data: serde_json::json!({
                "user_id": session.user_id,
                "username": session.username,
                "payload": payload,
            }),
            exclude: Some(connection_id.to_string()),
        })
        .await;
}

/// Runs once, before membership is removed: tell each room's survivors
/// who is left and push the shrunken membership to the Room Store.
pub async fn handle_disconnecting(state: &AppState, connection_id: &str) {
    for room_id in state.registry.rooms_of(connection_id) {
        let remaining: Vec<RoomMember> = state
            .fanout
            .room_members(&room_id)
            .into_iter()
            .filter(|member| member.connection_id != connection_id)
            .collect();
        let remaining = dedup_by_user(remaining);
        let member_ids = member_user_ids(&remaining);

        if !remaining.is_empty() {
            state
                .fanout
                .publish(RelayFrame {
                    room_id: room_id.clone(),
                    event_name: EventName::PRESENCE_UPDATE.to_string(),
                    data: presence_payload(&room_id, &remaining),
                    exclude: Some(connection_id.to_string()),
                })
                .await;
        }

        state.fanout.announce_leave(&room_id, connection_id).await;

        // Fire and forget; the disconnect does not cancel this.
        let store = state.store.clone();
        let room = room_id.clone();
        tokio::spawn(async move {
            if let Err(err) = store.sync_room_data(&room, None, member_ids, None, None).await {
                tracing::error!(%room, ?err, "room store membership push failed");
            }
        });
    }
}

/// Terminal state: forget the connection. No further events are
/// accepted for this connection id.
pub fn handle_disconnect(state: &AppState, connection_id: &str) {
    state.registry.remove(connection_id);
    state.sessions.unbind_connection(connection_id);
}

fn presence_payload(room_id: &str, members: &[RoomMember]) -> Value {
    serde_json::json!({
        "room_id": room_id,
        "members": members
            .iter()
            .map(|m| serde_json::json!({ "user_id": m.user_id, "username": m.username }))
            .collect::<Vec<_>>(),
    })
}
