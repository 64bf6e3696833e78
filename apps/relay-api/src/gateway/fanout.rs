//! Fan-out: the local broadcast hub and the cross-instance strategy.
//!
//! Every connected session subscribes to a single `tokio::sync::broadcast`
//! channel and filters frames locally by room membership. The
//! cross-instance strategy is an explicit enum decided once at startup —
//! never inferred from a live object at runtime.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::{Config, StorageStrategy};

use super::registry::{ConnectionRegistry, RoomMember};
use super::stream::SharedStreamFanout;

/// Capacity of the local broadcast channel. Receivers that fall behind
/// skip frames (RecvError::Lagged) — the permitted loss mode for
/// volatile events under load.
const RELAY_CAPACITY: usize = 4096;

/// A relay event addressed to the connections of one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Target room. A connection id here addresses a single connection
    /// through its self-room.
    pub room_id: String,
    pub event_name: String,
    pub data: Value,
    /// Connection excluded from delivery (usually the sender).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
}

/// The local broadcast hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct RelayHub {
    sender: broadcast::Sender<Arc<RelayFrame>>,
}

impl RelayHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(RELAY_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the hub. Each session calls this once to get its
    /// own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RelayFrame>> {
        self.sender.subscribe()
    }

    /// Dispatch a frame to all local sessions.
    pub fn dispatch(&self, frame: RelayFrame) {
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(frame));
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out adapter, selected once at startup from `STORAGE_STRATEGY`.
pub enum Fanout {
    /// Relay events only reach connections on this instance.
    InProcess {
        hub: RelayHub,
        registry: Arc<ConnectionRegistry>,
    },
    /// Relay events also traverse a shared capped redis stream consumed
    /// by every instance.
    SharedStream(SharedStreamFanout),
}

impl Fanout {
    /// Build the configured adapter.
    ///
    /// A shared-stream initialization failure is logged and degrades to
    /// in-process fan-out: cross-instance delivery becomes unavailable
    /// but this instance keeps serving.
    pub async fn init(config: &Config, hub: RelayHub, registry: Arc<ConnectionRegistry>) -> Self {
        match config.storage_strategy {
            StorageStrategy::Memory => Self::InProcess { hub, registry },
            StorageStrategy::Stream => {
                match SharedStreamFanout::connect(&config.redis_url, hub.clone(), registry.clone())
                    .await
                {
                    Ok(shared) => Self::SharedStream(shared),
                    Err(err) => {
                        tracing::warn!(
                            ?err,
                            "shared stream unavailable, falling back to in-process fan-out"
                        );
                        Self::InProcess { hub, registry }
                    }
                }
            }
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedStream(_))
    }

    /// Deliver a frame to the room's connections on this instance and,
    /// when shared, on every other instance. Fire and forget.
    pub async fn publish(&self, frame: RelayFrame) {
        match self {
            Self::InProcess { hub, .. } => hub.dispatch(frame),
            Self::SharedStream(shared) => shared.publish(frame).await,
        }
    }

    /// Deliver a frame on this instance only (self-room addressing —
    /// the target connection is by definition local).
    pub fn publish_local(&self, frame: RelayFrame) {
        match self {
            Self::InProcess { hub, .. } => hub.dispatch(frame),
            Self::SharedStream(shared) => shared.dispatch_local(frame),
        }
    }

    /// Current members of a room.
    ///
    /// Recomputed on every call and eventually consistent: joins and
    /// leaves racing with the enumeration, locally or on another
    /// instance, may or may not be visible. Last computed snapshot wins
    /// at each consumer.
    pub fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        match self {
            Self::InProcess { registry, .. } => registry.members_of(room_id),
            Self::SharedStream(shared) => shared.room_members(room_id),
        }
    }

    /// Tell other instances a connection entered a room. No-op when
    /// in-process.
    pub async fn announce_join(&self, room_id: &str, member: &RoomMember) {
        if let Self::SharedStream(shared) = self {
            shared.announce_join(room_id, member).await;
        }
    }

    /// Tell other instances a connection left a room. No-op when
    /// in-process.
    pub async fn announce_leave(&self, room_id: &str, connection_id: &str) {
        if let Self::SharedStream(shared) = self {
            shared.announce_leave(room_id, connection_id).await;
        }
    }
}
