//! Presence registry
//!
//! Authoritative set of connected participants per conference room and their
//! last known media status. Every mutation and the broadcasts it causes happen
//! under one write lock, so the order in which any connection observes
//! join/leave events matches the order the registry applied them. That is what
//! keeps a joiner's snapshot consistent with the updates that follow it.

use crate::ws::connections::ConnectionManager;
use parley_protocol::{MediaPatch, ParticipantId, PresenceRecord, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Rooms {
    /// room -> participant -> record
    members: HashMap<String, HashMap<ParticipantId, PresenceRecord>>,
    /// participant -> room
    membership: HashMap<ParticipantId, String>,
}

pub struct PresenceRegistry {
    connections: Arc<ConnectionManager>,
    rooms: RwLock<Rooms>,
}

impl PresenceRegistry {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            rooms: RwLock::new(Rooms::default()),
        }
    }

    /// Register `connection_id` in `room`.
    ///
    /// The joiner receives `presence:sync` with every member of the room,
    /// itself included; everybody else receives a `join` update.
    pub async fn join(&self, room: &str, connection_id: ParticipantId) -> PresenceRecord {
        let mut rooms = self.rooms.write().await;

        if let Some(previous_room) = rooms.membership.get(&connection_id).cloned() {
            tracing::warn!(
                "Connection {} joined {} while still in {}, moving it",
                connection_id,
                room,
                previous_room
            );
            if let Some(members) = rooms.members.get_mut(&previous_room) {
                members.remove(&connection_id);
            }
        }

        let record = PresenceRecord::new(connection_id.clone());
        rooms
            .membership
            .insert(connection_id.clone(), room.to_string());
        let members = rooms.members.entry(room.to_string()).or_default();
        members.insert(connection_id.clone(), record.clone());

        let participants = sorted_snapshot(members);
        let others: Vec<ParticipantId> = members
            .keys()
            .filter(|id| **id != connection_id)
            .cloned()
            .collect();

        self.connections
            .send_to_connection(
                &connection_id,
                &ServerMessage::PresenceSync {
                    participants,
                    self_id: connection_id.clone(),
                },
            )
            .await;
        self.connections
            .send_to_many(&others, &ServerMessage::joined(record.clone()))
            .await;

        tracing::info!(
            "Participant {} joined room {} ({} present)",
            connection_id,
            room,
            others.len() + 1
        );

        record
    }

    /// Merge a partial media update and tell the rest of the room.
    ///
    /// Unknown connections are ignored.
    pub async fn update_status(
        &self,
        connection_id: &ParticipantId,
        patch: MediaPatch,
    ) -> Option<PresenceRecord> {
        let mut rooms = self.rooms.write().await;

        let Some(room) = rooms.membership.get(connection_id).cloned() else {
            tracing::debug!("Status change from unregistered connection {}", connection_id);
            return None;
        };
        let members = rooms.members.get_mut(&room)?;
        let record = members.get_mut(connection_id)?;
        record.media.apply(&patch);
        let record = record.clone();

        let others: Vec<ParticipantId> = members
            .keys()
            .filter(|id| *id != connection_id)
            .cloned()
            .collect();

        self.connections
            .send_to_many(
                &others,
                &ServerMessage::StatusUpdate {
                    id: connection_id.clone(),
                    media: record.media.into(),
                },
            )
            .await;

        tracing::debug!(
            "Participant {} media now cam={} mic={}",
            connection_id,
            record.media.cam,
            record.media.mic
        );

        Some(record)
    }

    /// Drop the record and broadcast a `leave` to whoever remains.
    pub async fn leave(&self, connection_id: &ParticipantId) -> Option<PresenceRecord> {
        let mut rooms = self.rooms.write().await;

        let room = rooms.membership.remove(connection_id)?;
        let members = rooms.members.get_mut(&room)?;
        let record = members.remove(connection_id)?;

        let remaining: Vec<ParticipantId> = members.keys().cloned().collect();
        if remaining.is_empty() {
            rooms.members.remove(&room);
        }

        self.connections
            .send_to_many(&remaining, &ServerMessage::left(connection_id.clone()))
            .await;

        tracing::info!(
            "Participant {} left room {} ({} remaining)",
            connection_id,
            room,
            remaining.len()
        );

        Some(record)
    }

    pub async fn room_of(&self, connection_id: &ParticipantId) -> Option<String> {
        self.rooms.read().await.membership.get(connection_id).cloned()
    }

    /// Snapshot of a room ordered by arrival.
    pub async fn participants(&self, room: &str) -> Vec<PresenceRecord> {
        self.rooms
            .read()
            .await
            .members
            .get(room)
            .map(sorted_snapshot)
            .unwrap_or_default()
    }

    /// Send `message` to every member of `room`.
    pub async fn broadcast_to_room(&self, room: &str, message: &ServerMessage) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.members.get(room) {
            self.connections.send_to_many(members.keys(), message).await;
        }
    }
}

fn sorted_snapshot(members: &HashMap<ParticipantId, PresenceRecord>) -> Vec<PresenceRecord> {
    let mut participants: Vec<PresenceRecord> = members.values().cloned().collect();
    participants.sort_by(|a, b| {
        a.connected_at
            .cmp(&b.connected_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    participants
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{MediaStatus, PresenceAction};
    use tokio::sync::mpsc;

    struct Harness {
        registry: PresenceRegistry,
        connections: Arc<ConnectionManager>,
    }

    impl Harness {
        fn new() -> Self {
            let connections = Arc::new(ConnectionManager::new());
            Self {
                registry: PresenceRegistry::new(connections.clone()),
                connections,
            }
        }

        async fn connect(&self, id: &str) -> mpsc::UnboundedReceiver<String> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.connections.add_connection(ParticipantId::from(id), tx).await;
            rx
        }
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> ServerMessage {
        let raw = rx.try_recv().expect("expected a queued message");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn joiner_gets_snapshot_and_others_get_join() {
        let h = Harness::new();
        let mut a = h.connect("a1").await;
        let mut b = h.connect("b2").await;

        h.registry.join("main", ParticipantId::from("a1")).await;
        match next(&mut a) {
            ServerMessage::PresenceSync {
                participants,
                self_id,
            } => {
                assert_eq!(self_id, ParticipantId::from("a1"));
                assert_eq!(participants.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let record = h.registry.join("main", ParticipantId::from("b2")).await;
        assert_eq!(record.media, MediaStatus::default());

        match next(&mut b) {
            ServerMessage::PresenceSync { participants, .. } => {
                let ids: Vec<_> = participants.iter().map(|p| p.id.as_str()).collect();
                assert_eq!(ids, vec!["a1", "b2"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut a) {
            ServerMessage::PresenceUpdate {
                action: PresenceAction::Join,
                participant: Some(p),
                ..
            } => assert_eq!(p.id, ParticipantId::from("b2")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let h = Harness::new();
        let mut a = h.connect("a1").await;
        let _b = h.connect("b2").await;

        h.registry.join("red", ParticipantId::from("a1")).await;
        next(&mut a);
        h.registry.join("blue", ParticipantId::from("b2")).await;

        assert!(a.try_recv().is_err());
        assert_eq!(h.registry.participants("red").await.len(), 1);
        assert_eq!(
            h.registry.room_of(&ParticipantId::from("b2")).await.as_deref(),
            Some("blue")
        );
    }

    #[tokio::test]
    async fn status_update_merges_and_broadcasts() {
        let h = Harness::new();
        let mut a = h.connect("a1").await;
        let mut b = h.connect("b2").await;
        h.registry.join("main", ParticipantId::from("a1")).await;
        h.registry.join("main", ParticipantId::from("b2")).await;
        while a.try_recv().is_ok() {}
        while b.try_recv().is_ok() {}

        let a_id = ParticipantId::from("a1");
        h.registry
            .update_status(
                &a_id,
                MediaPatch {
                    cam: Some(true),
                    mic: Some(true),
                },
            )
            .await;
        let record = h
            .registry
            .update_status(
                &a_id,
                MediaPatch {
                    cam: Some(false),
                    mic: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(record.media, MediaStatus::new(false, true));

        // Sender is not echoed.
        assert!(a.try_recv().is_err());
        next(&mut b);
        match next(&mut b) {
            ServerMessage::StatusUpdate { id, media } => {
                assert_eq!(id, a_id);
                assert_eq!(media.cam, Some(false));
                assert_eq!(media.mic, Some(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_from_unknown_connection_is_ignored() {
        let h = Harness::new();
        let result = h
            .registry
            .update_status(&ParticipantId::from("ghost"), MediaPatch::default())
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn leave_broadcasts_and_drops_empty_room() {
        let h = Harness::new();
        let mut a = h.connect("a1").await;
        let _b = h.connect("b2").await;
        h.registry.join("main", ParticipantId::from("a1")).await;
        h.registry.join("main", ParticipantId::from("b2")).await;
        while a.try_recv().is_ok() {}

        h.registry.leave(&ParticipantId::from("b2")).await.unwrap();
        assert_eq!(next(&mut a), ServerMessage::left(ParticipantId::from("b2")));

        h.registry.leave(&ParticipantId::from("a1")).await.unwrap();
        assert!(h.registry.participants("main").await.is_empty());
        assert!(h.registry.leave(&ParticipantId::from("a1")).await.is_none());
    }
}
