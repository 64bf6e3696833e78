//! Cross-instance fan-out over a capped redis stream.
//!
//! Every instance XADDs its relay frames and membership announcements
//! to one shared stream and consumes everyone else's. The stream is
//! bounded (`MAXLEN ~`): once the cap is exceeded the oldest entries
//! are dropped — a backpressure valve, not a reliability guarantee.
//!
//! Remote membership is folded from join/leave announcements into a
//! process-local view keyed by origin instance. Because individual
//! announcements can be missed (a trimmed stream, an instance that
//! started late, a peer that crashed mid-session), every instance also
//! re-announces its full membership on an interval, and a peer that
//! stops announcing ages out of the view entirely. The view converges
//! within one sync interval of any missed entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

use super::fanout::{RelayFrame, RelayHub};
use super::registry::{ConnectionRegistry, RoomMember};

const STREAM_KEY: &str = "relay:events";

/// Approximate cap on the shared stream (XADD MAXLEN ~).
const STREAM_MAX_LEN: usize = 8192;

/// XREAD block timeout (ms).
const READ_BLOCK_MS: usize = 5000;

/// Interval between full-membership sync announcements.
const SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// How long a peer's membership survives without a fresh announcement.
/// Three missed syncs and the peer's entries are dropped.
const PRESENCE_TTL: Duration = Duration::from_secs(45);

/// One entry on the shared stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StreamEntry {
    Frame(RelayFrame),
    Join {
        room_id: String,
        member: RoomMember,
    },
    Leave {
        room_id: String,
        connection_id: String,
    },
    /// The announcing instance's entire membership. Replaces whatever
    /// the consumer previously folded for that instance.
    Sync {
        rooms: HashMap<String, Vec<RoomMember>>,
    },
}

/// Membership contributed by other instances, folded from consumed
/// stream entries. Own-instance entries are skipped on application, so
/// this never shadows the local registry.
struct RemotePresence {
    hub: RelayHub,
    instance_id: String,
    instances: DashMap<String, InstancePresence>,
}

/// One peer instance's contribution: room id → connection id → identity.
struct InstancePresence {
    deadline: Instant,
    rooms: HashMap<String, HashMap<String, RoomMember>>,
}

impl Default for InstancePresence {
    fn default() -> Self {
        Self {
            deadline: Instant::now() + PRESENCE_TTL,
            rooms: HashMap::new(),
        }
    }
}

impl RemotePresence {
    fn new(hub: RelayHub, instance_id: String) -> Self {
        Self {
            hub,
            instance_id,
            instances: DashMap::new(),
        }
    }

    /// Fold one consumed entry: re-dispatch foreign frames into the
    /// local hub, fold membership announcements into the per-instance
    /// view. Entries this instance appended itself were already
    /// delivered locally and are skipped.
    fn apply(&self, origin: Option<&str>, entry: StreamEntry) {
        let Some(origin) = origin else { return };
        if origin == self.instance_id {
            return;
        }

        match entry {
            StreamEntry::Frame(frame) => self.hub.dispatch(frame),
            StreamEntry::Join { room_id, member } => {
                let mut presence = self.instances.entry(origin.to_string()).or_default();
                presence.deadline = Instant::now() + PRESENCE_TTL;
                presence
                    .rooms
                    .entry(room_id)
                    .or_default()
                    .insert(member.connection_id.clone(), member);
            }
            StreamEntry::Leave {
                room_id,
                connection_id,
            } => {
                if let Some(mut presence) = self.instances.get_mut(origin) {
                    presence.deadline = Instant::now() + PRESENCE_TTL;
                    if let Some(room) = presence.rooms.get_mut(&room_id) {
                        room.remove(&connection_id);
                        if room.is_empty() {
                            presence.rooms.remove(&room_id);
                        }
                    }
                }
            }
            StreamEntry::Sync { rooms } => {
                let rooms = rooms
                    .into_iter()
                    .map(|(room_id, members)| {
                        let members = members
                            .into_iter()
                            .map(|member| (member.connection_id.clone(), member))
                            .collect();
                        (room_id, members)
                    })
                    .collect();
                self.instances.insert(
                    origin.to_string(),
                    InstancePresence {
                        deadline: Instant::now() + PRESENCE_TTL,
                        rooms,
                    },
                );
            }
        }
    }

    /// Drop instances whose announcements have gone quiet. This is how
    /// a crashed peer's members leave the view.
    fn prune_stale(&self, now: Instant) {
        self.instances.retain(|_, presence| presence.deadline > now);
    }

    fn members_of(&self, room_id: &str) -> Vec<RoomMember> {
        let mut members = Vec::new();
        for presence in self.instances.iter() {
            if let Some(room) = presence.rooms.get(room_id) {
                members.extend(room.values().cloned());
            }
        }
        members
    }
}

pub struct SharedStreamFanout {
    hub: RelayHub,
    registry: Arc<ConnectionRegistry>,
    instance_id: String,
    redis: redis::aio::ConnectionManager,
    remote: Arc<RemotePresence>,
}

impl SharedStreamFanout {
    /// Connect to redis and start the consumer and sync tasks. Errors
    /// here are the caller's cue to fall back to in-process fan-out.
    pub async fn connect(
        redis_url: &str,
        hub: RelayHub,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url)?;
        let redis = redis::aio::ConnectionManager::new(client).await?;

        let instance_id =
            drawbridge_common::id::prefixed_ulid(drawbridge_common::id::prefix::INSTANCE);
        let remote = Arc::new(RemotePresence::new(hub.clone(), instance_id.clone()));

        let fanout = Self {
            hub,
            registry,
            instance_id,
            redis,
            remote,
        };
        fanout.spawn_consumer();
        fanout.spawn_announcer();

        tracing::info!(instance_id = %fanout.instance_id, "shared-stream fan-out connected");
        Ok(fanout)
    }

    /// Dispatch locally and append to the shared stream. Append
    /// failures are logged; the local relay already happened.
    pub async fn publish(&self, frame: RelayFrame) {
        self.hub.dispatch(frame.clone());
        self.append(StreamEntry::Frame(frame)).await;
    }

    /// Local-only dispatch (self-room addressing).
    pub fn dispatch_local(&self, frame: RelayFrame) {
        self.hub.dispatch(frame);
    }

    pub async fn announce_join(&self, room_id: &str, member: &RoomMember) {
        self.append(StreamEntry::Join {
            room_id: room_id.to_string(),
            member: member.clone(),
        })
        .await;
    }

    pub async fn announce_leave(&self, room_id: &str, connection_id: &str) {
        self.append(StreamEntry::Leave {
            room_id: room_id.to_string(),
            connection_id: connection_id.to_string(),
        })
        .await;
    }

    /// Local registry enumeration merged with the remote view.
    pub fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        let mut members = self.registry.members_of(room_id);
        members.extend(self.remote.members_of(room_id));
        members
    }

    async fn append(&self, entry: StreamEntry) {
        let mut conn = self.redis.clone();
        append_entry(&mut conn, &self.instance_id, &entry).await;
    }

    fn spawn_consumer(&self) {
        let remote = self.remote.clone();
        let mut conn = self.redis.clone();

        tokio::spawn(async move {
            // Start at the stream tail. History before this instance
            // came up is reconstructed from the peers' next sync
            // announcements, not replayed.
            let mut last_id = "$".to_string();
            loop {
                let opts = StreamReadOptions::default().block(READ_BLOCK_MS);
                let reply: Result<Option<StreamReadReply>, redis::RedisError> = conn
                    .xread_options(&[STREAM_KEY], &[last_id.as_str()], &opts)
                    .await;

                remote.prune_stale(Instant::now());

                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(?err, "shared stream read failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for key in reply.keys {
                    for entry in key.ids {
                        last_id = entry.id.clone();

                        let origin: Option<String> = entry.get("origin");
                        let body: Option<String> = entry.get("body");
                        let Some(body) = body else { continue };

                        match serde_json::from_str::<StreamEntry>(&body) {
                            Ok(parsed) => remote.apply(origin.as_deref(), parsed),
                            Err(err) => {
                                tracing::debug!(?err, "unreadable stream entry, skipping");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Re-announce this instance's full membership on an interval. Late
    /// starters backfill from these, and peers that missed an
    /// individual leave converge on the next one.
    fn spawn_announcer(&self) {
        let registry = self.registry.clone();
        let instance_id = self.instance_id.clone();
        let mut conn = self.redis.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SYNC_INTERVAL).await;
                let entry = StreamEntry::Sync {
                    rooms: registry.membership_snapshot(),
                };
                append_entry(&mut conn, &instance_id, &entry).await;
            }
        });
    }
}

async fn append_entry(
    conn: &mut redis::aio::ConnectionManager,
    instance_id: &str,
    entry: &StreamEntry,
) {
    let body = match serde_json::to_string(entry) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(?err, "unserializable stream entry");
            return;
        }
    };

    let result: Result<String, redis::RedisError> = conn
        .xadd_maxlen(
            STREAM_KEY,
            StreamMaxlen::Approx(STREAM_MAX_LEN),
            "*",
            &[("origin", instance_id), ("body", body.as_str())],
        )
        .await;
    if let Err(err) = result {
        tracing::error!(?err, "shared stream append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(connection_id: &str, user_id: &str) -> RoomMember {
        RoomMember {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            username: format!("name-{user_id}"),
        }
    }

    fn presence() -> RemotePresence {
        RemotePresence::new(RelayHub::new(), "inst_self".into())
    }

    #[test]
    fn stream_entry_round_trips() {
        let entry = StreamEntry::Join {
            room_id: "doc-42".into(),
            member: member("conn_a", "u1"),
        };

        let json = serde_json::to_string(&entry).unwrap();
        match serde_json::from_str::<StreamEntry>(&json).unwrap() {
            StreamEntry::Join { room_id, member } => {
                assert_eq!(room_id, "doc-42");
                assert_eq!(member.user_id, "u1");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn frame_entry_is_tagged() {
        let entry = StreamEntry::Frame(RelayFrame {
            room_id: "doc-42".into(),
            event_name: "ROOM_BROADCAST".into(),
            data: serde_json::json!({"x": 1}),
            exclude: None,
        });
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
        assert_eq!(value["kind"], "frame");
    }

    #[test]
    fn own_origin_entries_are_not_reapplied() {
        let remote = presence();
        let mut rx = remote.hub.subscribe();

        remote.apply(
            Some("inst_self"),
            StreamEntry::Frame(RelayFrame {
                room_id: "doc-42".into(),
                event_name: "ROOM_BROADCAST".into(),
                data: serde_json::Value::Null,
                exclude: None,
            }),
        );
        remote.apply(
            Some("inst_self"),
            StreamEntry::Join {
                room_id: "doc-42".into(),
                member: member("conn_a", "u1"),
            },
        );

        assert!(rx.try_recv().is_err());
        assert!(remote.members_of("doc-42").is_empty());
    }

    #[test]
    fn foreign_frame_is_redispatched_into_the_hub() {
        let remote = presence();
        let mut rx = remote.hub.subscribe();

        remote.apply(
            Some("inst_peer"),
            StreamEntry::Frame(RelayFrame {
                room_id: "doc-42".into(),
                event_name: "VOLATILE_BROADCAST".into(),
                data: serde_json::json!({"x": 1}),
                exclude: Some("conn_far".into()),
            }),
        );

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.room_id, "doc-42");
        assert_eq!(frame.event_name, "VOLATILE_BROADCAST");
        assert_eq!(frame.exclude.as_deref(), Some("conn_far"));
    }

    #[test]
    fn join_and_leave_fold_into_the_remote_view() {
        let remote = presence();

        remote.apply(
            Some("inst_peer"),
            StreamEntry::Join {
                room_id: "doc-42".into(),
                member: member("conn_a", "u1"),
            },
        );
        remote.apply(
            Some("inst_peer"),
            StreamEntry::Join {
                room_id: "doc-42".into(),
                member: member("conn_b", "u2"),
            },
        );
        assert_eq!(remote.members_of("doc-42").len(), 2);

        remote.apply(
            Some("inst_peer"),
            StreamEntry::Leave {
                room_id: "doc-42".into(),
                connection_id: "conn_a".into(),
            },
        );
        let members = remote.members_of("doc-42");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].connection_id, "conn_b");

        remote.apply(
            Some("inst_peer"),
            StreamEntry::Leave {
                room_id: "doc-42".into(),
                connection_id: "conn_b".into(),
            },
        );
        assert!(remote.members_of("doc-42").is_empty());
    }

    #[test]
    fn sync_replaces_only_that_instances_contribution() {
        let remote = presence();

        remote.apply(
            Some("inst_peer"),
            StreamEntry::Join {
                room_id: "doc-old".into(),
                member: member("conn_a", "u1"),
            },
        );
        remote.apply(
            Some("inst_other"),
            StreamEntry::Join {
                room_id: "doc-old".into(),
                member: member("conn_x", "u9"),
            },
        );

        // inst_peer moved on: its member left doc-old for doc-new.
        remote.apply(
            Some("inst_peer"),
            StreamEntry::Sync {
                rooms: HashMap::from([("doc-new".to_string(), vec![member("conn_a", "u1")])]),
            },
        );

        // inst_peer's stale entry is gone, inst_other's is untouched.
        let old = remote.members_of("doc-old");
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].connection_id, "conn_x");
        assert_eq!(remote.members_of("doc-new").len(), 1);
    }

    #[test]
    fn quiet_instance_ages_out_of_the_view() {
        let remote = presence();
        remote.apply(
            Some("inst_peer"),
            StreamEntry::Join {
                room_id: "doc-42".into(),
                member: member("conn_a", "u1"),
            },
        );

        remote.prune_stale(Instant::now());
        assert_eq!(remote.members_of("doc-42").len(), 1);

        remote.prune_stale(Instant::now() + PRESENCE_TTL + Duration::from_secs(1));
        assert!(remote.members_of("doc-42").is_empty());
    }
}
