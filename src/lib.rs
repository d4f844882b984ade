pub mod auth;
pub mod blog;
pub mod client;
pub mod conversations;
pub mod db;
pub mod donations;
pub mod error;
pub mod fees;
pub mod library;
pub mod messages;
pub mod realtime;

use axum::extract::FromRef;
use sqlx::SqlitePool;

pub use error::{AppResult, ChatError, api_ok};

use realtime::{hub::Hub, presence::PresenceTracker, typing::TypingCoordinator};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub hub: Hub,
    pub presence: PresenceTracker,
    pub typing: TypingCoordinator,
}

impl AppState {
    pub fn new(db_pool: SqlitePool) -> AppState {
        AppState {
            db_pool,
            hub: Hub::new(),
            presence: PresenceTracker::new(),
            typing: TypingCoordinator::new(),
        }
    }
}

/// Server clock, unix milliseconds. All persisted timestamps come from here,
/// never from the client.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
