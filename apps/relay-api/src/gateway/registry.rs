//! Live-connection registry.
//!
//! Rooms are derived, never stored: the membership of a room is "the
//! connections whose joined set contains the key", recomputed on every
//! enumeration. There is no second source of truth to go stale.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One connection's appearance in a room, as seen by an enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
}

struct ConnectionEntry {
    user_id: String,
    username: String,
    /// Rooms this connection has joined. Always contains the self-room
    /// (the connection's own id) used for point-to-point addressing;
    /// the self-room is excluded from membership notifications.
    rooms: HashSet<String>,
}

pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register an authenticated connection. Its joined set starts with
    /// the self-room.
    pub fn register(&self, connection_id: &str, user_id: &str, username: &str) {
        let mut rooms = HashSet::new();
        rooms.insert(connection_id.to_string());
        self.inner.insert(
            connection_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                username: username.to_string(),
                rooms,
            },
        );
    }

    /// Add a room to the connection's joined set. Returns `false` when
    /// the connection was already a member (idempotent join).
    pub fn join(&self, connection_id: &str, room_id: &str) -> bool {
        match self.inner.get_mut(connection_id) {
            Some(mut entry) => entry.rooms.insert(room_id.to_string()),
            None => false,
        }
    }

    pub fn is_member(&self, connection_id: &str, room_id: &str) -> bool {
        self.inner
            .get(connection_id)
            .map(|entry| entry.rooms.contains(room_id))
            .unwrap_or(false)
    }

    /// Rooms the connection has joined, excluding its self-room.
    pub fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        match self.inner.get(connection_id) {
            Some(entry) => entry
                .rooms
                .iter()
                .filter(|room| room.as_str() != connection_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Fresh enumeration of the connections currently in a room on this
    /// instance. Joins and leaves interleaved with the enumeration may
    /// or may not be visible.
    pub fn members_of(&self, room_id: &str) -> Vec<RoomMember> {
        let mut members = Vec::new();
        for entry in self.inner.iter() {
            if entry.rooms.contains(room_id) {
                members.push(RoomMember {
                    connection_id: entry.key().clone(),
                    user_id: entry.user_id.clone(),
                    username: entry.username.clone(),
                });
            }
        }
        members
    }

    /// Every room on this instance with its current members, self-rooms
    /// excluded. Feeds the periodic membership announcements other
    /// instances fold into their remote view.
    pub fn membership_snapshot(&self) -> HashMap<String, Vec<RoomMember>> {
        let mut rooms: HashMap<String, Vec<RoomMember>> = HashMap::new();
        for entry in self.inner.iter() {
            for room in &entry.rooms {
                if room == entry.key() {
                    continue;
                }
                rooms.entry(room.clone()).or_default().push(RoomMember {
                    connection_id: entry.key().clone(),
                    user_id: entry.user_id.clone(),
                    username: entry.username.clone(),
                });
            }
        }
        rooms
    }

    /// Forget a connection entirely.
    pub fn remove(&self, connection_id: &str) {
        self.inner.remove(connection_id);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse multiple connections from the same user into one entry,
/// preserving enumeration order.
pub fn dedup_by_user(members: Vec<RoomMember>) -> Vec<RoomMember> {
    let mut seen = HashSet::new();
    members
        .into_iter()
        .filter(|member| seen.insert(member.user_id.clone()))
        .collect()
}

pub fn member_user_ids(members: &[RoomMember]) -> Vec<String> {
    members.iter().map(|m| m.user_id.clone()).collect()
}
