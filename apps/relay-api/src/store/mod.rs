//! Room Store client: the external authoritative document service.
//!
//! The relay never merges document content itself. It submits updates
//! and reads back an authoritative copy after each membership or
//! content change. `Ok(None)` means the store knows no such room.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Authoritative room state as last known by the Room Store. The relay
/// never mutates a snapshot, only forwards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    /// Document content; opaque to the relay.
    pub elements: Value,
    /// Member user ids as last recorded by the store.
    #[serde(default)]
    pub member_ids: Vec<String>,
}

/// Synchronization contract with the Room Store.
///
/// Called on join (elements = None), on durable broadcast (elements =
/// the decoded delta, author = the sender), and on every
/// membership-affecting disconnect (elements = None, author = None).
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn sync_room_data(
        &self,
        room_id: &str,
        elements: Option<Value>,
        member_user_ids: Vec<String>,
        author_user_id: Option<&str>,
        credential: Option<&str>,
    ) -> Result<Option<RoomSnapshot>, RelayError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRoomStore {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    room_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    elements: Option<Value>,
    member_user_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_user_id: Option<&'a str>,
}

impl HttpRoomStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RoomStore for HttpRoomStore {
    async fn sync_room_data(
        &self,
        room_id: &str,
        elements: Option<Value>,
        member_user_ids: Vec<String>,
        author_user_id: Option<&str>,
        credential: Option<&str>,
    ) -> Result<Option<RoomSnapshot>, RelayError> {
        let url = format!("{}/api/rooms/sync", self.base_url);

        let mut request = self.http.post(&url).json(&SyncRequest {
            room_id,
            elements,
            member_user_ids,
            author_user_id,
        });
        if let Some(credential) = credential {
            request = request.bearer_auth(credential);
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            tracing::error!(status = %response.status(), %room_id, "room store sync rejected");
            return Err(RelayError::dependency("room store sync rejected"));
        }

        let snapshot: RoomSnapshot = response.json().await?;
        Ok(Some(snapshot))
    }
}
