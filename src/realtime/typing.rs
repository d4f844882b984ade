use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::realtime::{hub::Hub, protocol::ServerEvent};

/// A typing entry dies this long after its last refresh, stop signal or not.
pub const TYPING_TTL: Duration = Duration::from_secs(5);
/// `typing_start` refreshes are rebroadcast at most this often.
pub const TYPING_REBROADCAST: Duration = Duration::from_secs(2);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry {
    user_name: String,
    refreshed: Instant,
    last_broadcast: Instant,
}

/// Ephemeral per-conversation typing state. Never persisted; entries expire on
/// their own and the sweeper emits the matching stop event so clients converge
/// even when the explicit stop never arrives.
#[derive(Clone, Default)]
pub struct TypingCoordinator {
    inner: Arc<Mutex<HashMap<(Uuid, Uuid), Entry>>>,
}

impl TypingCoordinator {
    pub fn new() -> TypingCoordinator {
        TypingCoordinator::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, Uuid), Entry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts or refreshes the entry. Returns whether `user_typing` should be
    /// broadcast now (debounced against rapid repeats).
    pub fn start(&self, conversation_id: Uuid, user_id: Uuid, user_name: &str) -> bool {
        let now = Instant::now();
        let mut map = self.lock();
        match map.get_mut(&(conversation_id, user_id)) {
            Some(entry) if now.duration_since(entry.refreshed) < TYPING_TTL => {
                entry.refreshed = now;
                if now.duration_since(entry.last_broadcast) >= TYPING_REBROADCAST {
                    entry.last_broadcast = now;
                    true
                } else {
                    false
                }
            }
            _ => {
                map.insert(
                    (conversation_id, user_id),
                    Entry {
                        user_name: user_name.to_owned(),
                        refreshed: now,
                        last_broadcast: now,
                    },
                );
                true
            }
        }
    }

    /// Removes the entry. Returns whether it was present (and a stop event is
    /// due).
    pub fn stop(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.lock().remove(&(conversation_id, user_id)).is_some()
    }

    /// Lazily drops expired entries while reading, so a missed sweep never
    /// shows a stale typer.
    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<(Uuid, String)> {
        let now = Instant::now();
        let mut map = self.lock();
        map.retain(|_, entry| now.duration_since(entry.refreshed) < TYPING_TTL);
        let mut users: Vec<(Uuid, String)> = map
            .iter()
            .filter(|((conv, _), _)| *conv == conversation_id)
            .map(|((_, user), entry)| (*user, entry.user_name.clone()))
            .collect();
        users.sort_by_key(|(user, _)| *user);
        users
    }

    /// Removes everything past the TTL and returns it so the caller can emit
    /// the matching stop events.
    pub fn sweep(&self) -> Vec<(Uuid, Uuid, String)> {
        let now = Instant::now();
        let mut map = self.lock();
        let expired: Vec<(Uuid, Uuid, String)> = map
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.refreshed) >= TYPING_TTL)
            .map(|((conv, user), entry)| (*conv, *user, entry.user_name.clone()))
            .collect();
        for (conv, user, _) in &expired {
            map.remove(&(*conv, *user));
        }
        expired
    }

    /// Background sweep loop; emits `user_stop_typing` for every expiry.
    pub fn run_sweeper(self, hub: Hub) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                for (conversation_id, user_id, user_name) in self.sweep() {
                    debug!(%conversation_id, %user_id, "typing entry expired");
                    hub.broadcast_to_room(
                        conversation_id,
                        &ServerEvent::UserStopTyping {
                            conversation_id,
                            user_id,
                            user_name,
                        },
                    );
                }
            }
        })
    }
}
