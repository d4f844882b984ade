pub mod hub;
pub mod presence;
pub mod protocol;
pub mod typing;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use ws::AUTH_TIMEOUT;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::chat_ws))
}
