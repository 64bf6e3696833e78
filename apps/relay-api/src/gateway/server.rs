//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::events::{
    BroadcastPayload, ClientMessage, IdentifyPayload, JoinRoomPayload, ServerMessage,
    OP_BROADCAST, OP_IDENTIFY, OP_JOIN_ROOM, OP_VOLATILE,
};
use super::fanout::RelayFrame;
use super::handler::handle_identify;
use super::relay;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds). An
/// authentication attempt that never resolves is bounded here.
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// The one reason every authentication failure closes with. Specific
/// causes are logged, never sent to the client.
const AUTH_FAILED_REASON: &str = "Authentication failed";

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: wait for IDENTIFY within the handshake bound. Nothing is
    // queued or processed for the connection before this resolves.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => return Err("invalid json"),
            };

            if client_msg.op != OP_IDENTIFY {
                return Err("expected identify");
            }

            let payload: IdentifyPayload =
                serde_json::from_value(client_msg.d).map_err(|_| "invalid identify payload")?;
            return Ok(payload);
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "handshake failed");
            // Malformed frames are protocol errors, not auth failures.
            let (code, reason) = match reason {
                "invalid json" => (CLOSE_UNKNOWN_ERROR, "Invalid JSON"),
                "expected identify" => (CLOSE_NOT_AUTHENTICATED, AUTH_FAILED_REASON),
                _ => (CLOSE_AUTH_FAILED, AUTH_FAILED_REASON),
            };
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_HANDSHAKE_TIMEOUT, AUTH_FAILED_REASON).await;
            return;
        }
    };

    // Step 2: authenticate. Any failure rejects with the generic reason
    // and retains no state.
    let (connection_id, session, initial) = match handle_identify(&state, payload) {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "identify rejected");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, AUTH_FAILED_REASON).await;
            return;
        }
    };

    tracing::info!(
        connection_id = %connection_id,
        user_id = %session.user_id,
        "connection authenticated"
    );

    // Subscribe before sending the initial signals so frames published
    // concurrently with the handshake are not missed.
    let relay_rx = state.hub.subscribe();

    let mut delivered_initial = true;
    for msg in &initial {
        let json = serde_json::to_string(msg).unwrap();
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            delivered_initial = false;
            break;
        }
    }

    if delivered_initial {
        run_session(&state, &connection_id, ws_tx, ws_rx, relay_rx).await;
    }

    // Membership teardown, then the terminal state.
    relay::handle_disconnecting(&state, &connection_id).await;
    relay::handle_disconnect(&state, &connection_id);

    tracing::info!(connection_id = %connection_id, "connection closed");
}

/// Main session loop: process client opcodes in arrival order, forward
/// relay frames addressed to rooms this connection has joined.
async fn run_session(
    state: &AppState,
    connection_id: &str,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut relay_rx: broadcast::Receiver<Arc<RelayFrame>>,
) {
    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        // The session cache is the source of truth for
                        // who this connection is.
                        let Some(session) = state.sessions.session_for(connection_id) else {
                            break;
                        };

                        match client_msg.op {
                            OP_JOIN_ROOM => {
                                let Ok(payload) = serde_json::from_value::<JoinRoomPayload>(client_msg.d) else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid payload").await;
                                    break;
                                };
                                relay::handle_join(state, connection_id, &session, &payload.room_id).await;
                            }
                            OP_BROADCAST => {
                                let Ok(payload) = serde_json::from_value::<BroadcastPayload>(client_msg.d) else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid payload").await;
                                    break;
                                };
                                relay::handle_broadcast(state, connection_id, &session, &payload.room_id, payload.payload).await;
                            }
                            OP_VOLATILE => {
                                let Ok(payload) = serde_json::from_value::<BroadcastPayload>(client_msg.d) else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid payload").await;
                                    break;
                                };
                                relay::handle_volatile(state, connection_id, &session, &payload.room_id, payload.payload).await;
                            }
                            OP_IDENTIFY => {
                                // The credential is fixed at connection establishment.
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Relay frame from the fan-out hub.
            result = relay_rx.recv() => {
                match result {
                    Ok(frame) => {
                        if frame.exclude.as_deref() == Some(connection_id) {
                            continue;
                        }
                        if !state.registry.is_member(connection_id, &frame.room_id) {
                            continue;
                        }

                        let msg = ServerMessage::dispatch(&frame.event_name, frame.data.clone());
                        let json = serde_json::to_string(&msg).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Continue — the missed frames are simply dropped.
                        tracing::warn!(
                            connection_id = %connection_id,
                            skipped = n,
                            "connection lagged behind relay"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
