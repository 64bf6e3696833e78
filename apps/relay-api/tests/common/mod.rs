use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use tokio::time;
use tokio_tungstenite::tungstenite;

use relay_api::auth::cache::SessionCache;
use relay_api::auth::verifier::TokenVerifier;
use relay_api::config::{Config, StorageStrategy};
use relay_api::error::RelayError;
use relay_api::gateway::fanout::{Fanout, RelayHub};
use relay_api::gateway::registry::ConnectionRegistry;
use relay_api::store::{RoomSnapshot, RoomStore};
use relay_api::AppState;

pub const TEST_SECRET: &str = "relay-test-secret";

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Recording Room Store
// ---------------------------------------------------------------------------

/// One `sync_room_data` invocation as observed by the store.
#[derive(Debug, Clone)]
pub struct SyncCall {
    pub room_id: String,
    pub elements: Option<Value>,
    pub member_user_ids: Vec<String>,
    pub author_user_id: Option<String>,
    pub credential: Option<String>,
}

/// In-memory Room Store that records every call, mirroring the
/// store-behind-a-trait pattern used for the production HTTP client.
pub struct RecordingRoomStore {
    rooms: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<SyncCall>>,
}

impl RecordingRoomStore {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_room(self, room_id: &str, elements: Value) -> Self {
        self.rooms
            .lock()
            .unwrap()
            .insert(room_id.to_string(), elements);
        self
    }

    pub fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that carried a content delta (durable-broadcast persistence).
    pub fn persistence_calls(&self) -> Vec<SyncCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.elements.is_some())
            .collect()
    }
}

#[async_trait]
impl RoomStore for RecordingRoomStore {
    async fn sync_room_data(
        &self,
        room_id: &str,
        elements: Option<Value>,
        member_user_ids: Vec<String>,
        author_user_id: Option<&str>,
        credential: Option<&str>,
    ) -> Result<Option<RoomSnapshot>, RelayError> {
        self.calls.lock().unwrap().push(SyncCall {
            room_id: room_id.to_string(),
            elements: elements.clone(),
            member_user_ids,
            author_user_id: author_user_id.map(str::to_string),
            credential: credential.map(str::to_string),
        });

        let mut rooms = self.rooms.lock().unwrap();
        match rooms.get_mut(room_id) {
            Some(stored) => {
                if let Some(elements) = elements {
                    *stored = elements;
                }
                Ok(Some(RoomSnapshot {
                    room_id: room_id.to_string(),
                    elements: stored.clone(),
                    member_ids: Vec::new(),
                }))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// App state and server
// ---------------------------------------------------------------------------

fn test_config(strategy: StorageStrategy) -> Config {
    Config {
        relay_secret: TEST_SECRET.to_string(),
        room_store_url: "http://localhost:0".to_string(),
        storage_strategy: strategy,
        // Nothing listens on port 1 — stream init fails deterministically.
        redis_url: "redis://127.0.0.1:1/0".to_string(),
        port: 0,
    }
}

pub async fn test_state(store: Arc<RecordingRoomStore>, strategy: StorageStrategy) -> AppState {
    let config = test_config(strategy);
    let registry = Arc::new(ConnectionRegistry::new());
    let hub = RelayHub::new();
    let fanout = Arc::new(Fanout::init(&config, hub.clone(), registry.clone()).await);

    AppState {
        config: Arc::new(config),
        verifier: Arc::new(TokenVerifier::new(TEST_SECRET)),
        sessions: Arc::new(SessionCache::new()),
        registry,
        hub,
        fanout,
        store,
    }
}

/// Start an actual TCP server for WebSocket testing. The server runs in
/// the background.
pub async fn start_ws_server(state: AppState) -> SocketAddr {
    let app = relay_api::gateway::server::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

pub fn mint_token(user_id: &str, username: &str, permission: i64, exp_offset_secs: i64) -> String {
    let claims = serde_json::json!({
        "userId": user_id,
        "username": username,
        "fileId": "doc-42",
        "permission": permission,
        "exp": chrono::Utc::now().timestamp() + exp_offset_secs,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn writer_token(user_id: &str, username: &str) -> String {
    mint_token(user_id, username, 2, 3600)
}

// ---------------------------------------------------------------------------
// WebSocket helpers
// ---------------------------------------------------------------------------

pub async fn connect(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{addr}/gateway");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send(ws: &mut WsStream, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Send a raw text frame, not necessarily valid JSON.
pub async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_string().into()))
        .await
        .expect("ws send");
}

/// Receive the next text message within 5 seconds, parsed as JSON.
pub async fn recv_msg(ws: &mut WsStream) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse message")
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Receive the next dispatch and assert its event name; returns `d`.
pub async fn expect_event(ws: &mut WsStream, event_name: &str) -> Value {
    let msg = recv_msg(ws).await;
    assert_eq!(msg["op"], 0, "expected dispatch, got {msg}");
    assert_eq!(msg["t"], event_name, "unexpected event: {msg}");
    msg["d"].clone()
}

/// Assert nothing arrives for `ms` milliseconds.
pub async fn expect_silence(ws: &mut WsStream, ms: u64) {
    let result = time::timeout(Duration::from_millis(ms), ws.next()).await;
    if let Ok(Some(Ok(msg))) = result {
        panic!("expected silence, got {msg:?}");
    }
}

/// Receive the close frame and return (code, reason).
pub async fn expect_close(ws: &mut WsStream) -> (u16, String) {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");
        if let tungstenite::Message::Close(frame) = msg {
            let frame = frame.expect("close frame with code");
            return (frame.code.into(), frame.reason.to_string());
        }
    }
}

/// Connect and identify, reading signals until INIT_ROOM. Returns the
/// stream and every dispatch received during the handshake.
pub async fn connect_and_identify(addr: SocketAddr, token: &str) -> (WsStream, Vec<Value>) {
    let mut ws = connect(addr).await;
    send(&mut ws, serde_json::json!({ "op": 2, "d": { "token": token } })).await;

    let mut signals = Vec::new();
    loop {
        let msg = recv_msg(&mut ws).await;
        let done = msg["t"] == "INIT_ROOM";
        signals.push(msg);
        if done {
            return (ws, signals);
        }
    }
}

/// Poll until `cond` holds, for background (spawned) effects.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

/// Join a room and consume the expected snapshot delivery.
pub async fn join_room(ws: &mut WsStream, room_id: &str) -> Value {
    send(ws, serde_json::json!({ "op": 4, "d": { "room_id": room_id } })).await;
    expect_event(ws, "ROOM_SNAPSHOT").await
}
