use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::realtime::protocol::ServerEvent;

pub type SessionId = Uuid;

struct SessionHandle {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct HubInner {
    sessions: HashMap<SessionId, SessionHandle>,
    rooms: HashMap<Uuid, HashSet<SessionId>>,
}

/// Session registry and notification dispatcher. A room is the set of channel
/// sessions currently subscribed to one conversation; fanout is best-effort,
/// at-least-once per connected session, and persists nothing — the
/// reconciliation poller covers disconnected clients.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubInner>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HubInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HubInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, user_id: Uuid) -> (SessionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::now_v7();
        self.write()
            .sessions
            .insert(session_id, SessionHandle { user_id, tx });
        debug!(%session_id, %user_id, "session registered");
        (session_id, rx)
    }

    pub fn unregister(&self, session_id: SessionId) {
        let mut inner = self.write();
        inner.sessions.remove(&session_id);
        for members in inner.rooms.values_mut() {
            members.remove(&session_id);
        }
        debug!(%session_id, "session unregistered");
    }

    /// Idempotent: re-joining a room is a no-op.
    pub fn join_rooms(&self, session_id: SessionId, conversation_ids: &[Uuid]) {
        let mut inner = self.write();
        if !inner.sessions.contains_key(&session_id) {
            return;
        }
        for &conversation_id in conversation_ids {
            inner
                .rooms
                .entry(conversation_id)
                .or_default()
                .insert(session_id);
        }
    }

    /// Attaches every live session of one user to a room. Used when a member
    /// is added to a group while already connected.
    pub fn add_user_to_room(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut inner = self.write();
        let sessions: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, handle)| handle.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        if sessions.is_empty() {
            return;
        }
        let members = inner.rooms.entry(conversation_id).or_default();
        for session_id in sessions {
            members.insert(session_id);
        }
    }

    /// Detaches every session of one user from a room. Used when a member is
    /// removed from a group so they stop receiving pushes immediately.
    pub fn evict_user(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut inner = self.write();
        let doomed: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, handle)| handle.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        if let Some(members) = inner.rooms.get_mut(&conversation_id) {
            for session_id in doomed {
                members.remove(&session_id);
            }
        }
    }

    pub fn drop_room(&self, conversation_id: Uuid) {
        self.write().rooms.remove(&conversation_id);
    }

    fn serialize(event: &ServerEvent) -> Option<String> {
        match serde_json::to_string(event) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(%err, "failed to serialize server event");
                None
            }
        }
    }

    fn prune(&self, dead: Vec<SessionId>) {
        if dead.is_empty() {
            return;
        }
        let mut inner = self.write();
        for session_id in dead {
            inner.sessions.remove(&session_id);
            for members in inner.rooms.values_mut() {
                members.remove(&session_id);
            }
        }
    }

    pub fn broadcast_to_room(&self, conversation_id: Uuid, event: &ServerEvent) {
        let Some(text) = Hub::serialize(event) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let inner = self.read();
            let Some(members) = inner.rooms.get(&conversation_id) else {
                return;
            };
            for session_id in members {
                if let Some(handle) = inner.sessions.get(session_id) {
                    if handle.tx.send(text.clone()).is_err() {
                        dead.push(*session_id);
                    }
                }
            }
        }
        self.prune(dead);
    }

    pub fn send_to_session(&self, session_id: SessionId, event: &ServerEvent) {
        let Some(text) = Hub::serialize(event) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let inner = self.read();
            if let Some(handle) = inner.sessions.get(&session_id) {
                if handle.tx.send(text).is_err() {
                    dead.push(session_id);
                }
            }
        }
        self.prune(dead);
    }

    /// Fanout to every session belonging to any of the given users,
    /// independent of room subscriptions. Presence updates use this.
    pub fn send_to_users(&self, user_ids: &HashSet<Uuid>, event: &ServerEvent) {
        let Some(text) = Hub::serialize(event) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let inner = self.read();
            for (session_id, handle) in &inner.sessions {
                if user_ids.contains(&handle.user_id) && handle.tx.send(text.clone()).is_err() {
                    dead.push(*session_id);
                }
            }
        }
        self.prune(dead);
    }

    pub fn room_size(&self, conversation_id: Uuid) -> usize {
        self.read()
            .rooms
            .get(&conversation_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_event(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<ServerEvent> {
        rx.try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).unwrap())
    }

    #[tokio::test]
    async fn broadcast_reaches_every_room_member() {
        let hub = Hub::new();
        let room = Uuid::now_v7();
        let (s1, mut rx1) = hub.register(Uuid::now_v7());
        let (s2, mut rx2) = hub.register(Uuid::now_v7());
        hub.join_rooms(s1, &[room]);
        hub.join_rooms(s2, &[room]);

        hub.broadcast_to_room(
            room,
            &ServerEvent::MessageDeleted {
                message_id: Uuid::nil(),
                conversation_id: room,
            },
        );

        assert!(matches!(
            recv_event(&mut rx1),
            Some(ServerEvent::MessageDeleted { .. })
        ));
        assert!(matches!(
            recv_event(&mut rx2),
            Some(ServerEvent::MessageDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn rejoining_a_room_is_a_noop() {
        let hub = Hub::new();
        let room = Uuid::now_v7();
        let (s1, mut rx1) = hub.register(Uuid::now_v7());
        hub.join_rooms(s1, &[room]);
        hub.join_rooms(s1, &[room]);
        assert_eq!(hub.room_size(room), 1);

        hub.broadcast_to_room(
            room,
            &ServerEvent::MessageDeleted {
                message_id: Uuid::nil(),
                conversation_id: room,
            },
        );
        assert!(recv_event(&mut rx1).is_some());
        assert!(recv_event(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn evicted_user_stops_receiving_pushes() {
        let hub = Hub::new();
        let room = Uuid::now_v7();
        let user = Uuid::now_v7();
        let (s1, mut rx1) = hub.register(user);
        hub.join_rooms(s1, &[room]);

        hub.evict_user(room, user);
        hub.broadcast_to_room(
            room,
            &ServerEvent::MessageDeleted {
                message_id: Uuid::nil(),
                conversation_id: room,
            },
        );
        assert!(recv_event(&mut rx1).is_none());
    }

    #[tokio::test]
    async fn dead_sessions_are_pruned_on_send() {
        let hub = Hub::new();
        let room = Uuid::now_v7();
        let (s1, rx1) = hub.register(Uuid::now_v7());
        hub.join_rooms(s1, &[room]);
        drop(rx1);

        hub.broadcast_to_room(
            room,
            &ServerEvent::MessageDeleted {
                message_id: Uuid::nil(),
                conversation_id: room,
            },
        );
        assert_eq!(hub.room_size(room), 0);
    }
}
