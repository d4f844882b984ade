use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    AppResult, ChatError, now_ms,
    realtime::{hub::Hub, protocol::ServerEvent},
};

/// How long a user keeps their status after their last channel closes. A
/// reconnect inside this window is treated as never having left.
pub const OFFLINE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,
}

struct Entry {
    status: PresenceStatus,
    last_seen: Option<i64>,
    connections: u32,
    /// Bumped on every connect and on every last-disconnect; a pending grace
    /// timer only fires if its epoch is still current.
    epoch: u64,
}

impl Default for Entry {
    fn default() -> Entry {
        Entry {
            status: PresenceStatus::Offline,
            last_seen: None,
            connections: 0,
            epoch: 0,
        }
    }
}

/// Per-user status and last-seen. State machine: offline -> online on the
/// first active channel; online <-> away/busy by explicit request only;
/// anything -> offline once the last channel closes and the grace period
/// passes. Redundant transitions return `None` and are never rebroadcast.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl PresenceTracker {
    pub fn new() -> PresenceTracker {
        PresenceTracker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connected(&self, user_id: Uuid) -> Option<PresenceChange> {
        let mut map = self.lock();
        let entry = map.entry(user_id).or_default();
        entry.connections += 1;
        entry.epoch += 1;
        if entry.status == PresenceStatus::Offline {
            entry.status = PresenceStatus::Online;
            Some(PresenceChange {
                user_id,
                status: PresenceStatus::Online,
                last_seen: None,
            })
        } else {
            None
        }
    }

    /// Returns an epoch token when this was the user's last open channel; the
    /// caller hands it to `schedule_offline`.
    pub fn disconnected(&self, user_id: Uuid) -> Option<u64> {
        let mut map = self.lock();
        let entry = map.entry(user_id).or_default();
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            entry.epoch += 1;
            Some(entry.epoch)
        } else {
            None
        }
    }

    /// Called after the grace period. A stale epoch means the user came back
    /// in the meantime and the transition is abandoned.
    pub fn confirm_offline(&self, user_id: Uuid, epoch: u64) -> Option<PresenceChange> {
        let mut map = self.lock();
        let entry = map.get_mut(&user_id)?;
        if entry.connections > 0 || entry.epoch != epoch || entry.status == PresenceStatus::Offline
        {
            return None;
        }
        entry.status = PresenceStatus::Offline;
        entry.last_seen = Some(now_ms());
        Some(PresenceChange {
            user_id,
            status: PresenceStatus::Offline,
            last_seen: entry.last_seen,
        })
    }

    /// Explicit client request. Offline is not requestable, and a request
    /// while disconnected is rejected.
    pub fn set_status(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
    ) -> AppResult<Option<PresenceChange>> {
        if status == PresenceStatus::Offline {
            return Err(ChatError::Validation(
                "offline is set by disconnecting, not by request".to_owned(),
            ));
        }
        let mut map = self.lock();
        let entry = map.entry(user_id).or_default();
        if entry.connections == 0 {
            return Err(ChatError::Validation(
                "no active channel for this user".to_owned(),
            ));
        }
        if entry.status == status {
            return Ok(None);
        }
        entry.status = status;
        Ok(Some(PresenceChange {
            user_id,
            status,
            last_seen: None,
        }))
    }

    pub fn status_of(&self, user_id: Uuid) -> (PresenceStatus, Option<i64>) {
        let map = self.lock();
        map.get(&user_id)
            .map(|e| (e.status, e.last_seen))
            .unwrap_or((PresenceStatus::Offline, None))
    }
}

/// Persists the transition and fans it out, room-scoped: only users sharing at
/// least one conversation with the subject hear about it.
pub async fn broadcast_change(
    pool: &SqlitePool,
    hub: &Hub,
    change: &PresenceChange,
) -> AppResult<()> {
    sqlx::query("UPDATE users SET status=?, last_seen_ms=COALESCE(?, last_seen_ms) WHERE id=?")
        .bind(change.status.as_str())
        .bind(change.last_seen)
        .bind(change.user_id.to_string())
        .execute(pool)
        .await?;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT m2.user_id FROM members m1 \
         JOIN members m2 ON m1.conversation_id = m2.conversation_id \
         WHERE m1.user_id=? AND m2.user_id<>?",
    )
    .bind(change.user_id.to_string())
    .bind(change.user_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut peers = HashSet::with_capacity(rows.len());
    for (id,) in rows {
        peers.insert(Uuid::parse_str(&id)?);
    }

    debug!(user = %change.user_id, status = change.status.as_str(), peers = peers.len(), "presence change");
    hub.send_to_users(
        &peers,
        &ServerEvent::UserStatusChanged {
            user_id: change.user_id,
            status: change.status,
            last_seen: change.last_seen,
        },
    );
    Ok(())
}

/// Arms the grace timer after a last-channel disconnect.
pub fn schedule_offline(
    tracker: PresenceTracker,
    pool: SqlitePool,
    hub: Hub,
    user_id: Uuid,
    epoch: u64,
) {
    tokio::spawn(async move {
        tokio::time::sleep(OFFLINE_GRACE).await;
        if let Some(change) = tracker.confirm_offline(user_id, epoch) {
            if let Err(err) = broadcast_change(&pool, &hub, &change).await {
                warn!(%err, %user_id, "failed to broadcast offline transition");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_goes_online_once() {
        let tracker = PresenceTracker::new();
        let user = Uuid::now_v7();
        let change = tracker.connected(user).unwrap();
        assert_eq!(change.status, PresenceStatus::Online);
        // second channel for the same user is not a transition
        assert!(tracker.connected(user).is_none());
    }

    #[test]
    fn reconnect_during_grace_cancels_offline() {
        let tracker = PresenceTracker::new();
        let user = Uuid::now_v7();
        tracker.connected(user);
        let epoch = tracker.disconnected(user).unwrap();
        tracker.connected(user);
        assert!(tracker.confirm_offline(user, epoch).is_none());
        assert_eq!(tracker.status_of(user).0, PresenceStatus::Online);
    }

    #[test]
    fn last_disconnect_plus_grace_goes_offline() {
        let tracker = PresenceTracker::new();
        let user = Uuid::now_v7();
        tracker.connected(user);
        let epoch = tracker.disconnected(user).unwrap();
        let change = tracker.confirm_offline(user, epoch).unwrap();
        assert_eq!(change.status, PresenceStatus::Offline);
        assert!(change.last_seen.is_some());
    }

    #[test]
    fn redundant_status_request_is_a_noop() {
        let tracker = PresenceTracker::new();
        let user = Uuid::now_v7();
        tracker.connected(user);
        assert!(
            tracker
                .set_status(user, PresenceStatus::Away)
                .unwrap()
                .is_some()
        );
        assert!(
            tracker
                .set_status(user, PresenceStatus::Away)
                .unwrap()
                .is_none()
        );
        assert!(
            tracker
                .set_status(user, PresenceStatus::Busy)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn offline_cannot_be_requested() {
        let tracker = PresenceTracker::new();
        let user = Uuid::now_v7();
        tracker.connected(user);
        assert!(tracker.set_status(user, PresenceStatus::Offline).is_err());
    }

    #[test]
    fn disconnected_user_cannot_set_status() {
        let tracker = PresenceTracker::new();
        assert!(
            tracker
                .set_status(Uuid::now_v7(), PresenceStatus::Away)
                .is_err()
        );
    }
}
