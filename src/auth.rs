use axum::{
    Json, Router, debug_handler,
    extract::{FromRef, FromRequestParts, State},
    http::{header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, AppState, ChatError, api_ok, now_ms,
    realtime::presence::{self, PresenceStatus},
};

/// Platform-wide role, distinct from the per-conversation member role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Role {
        match s {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

/// What the identity collaborator vouches for once a bearer token checks out.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// The identity gate. Token issuance lives with the external auth
/// collaborator; this only checks the `auth_tokens` table.
pub async fn verify_token(pool: &SqlitePool, token: &str) -> AppResult<Identity> {
    let row: Option<(String, String, String)> = sqlx::query_as(
        "SELECT u.id, u.display_name, u.role FROM auth_tokens t \
         JOIN users u ON u.id = t.user_id \
         WHERE t.token = ? AND (t.expires_at_ms IS NULL OR t.expires_at_ms > ?)",
    )
    .bind(token)
    .bind(now_ms())
    .fetch_optional(pool)
    .await?;

    let Some((id, display_name, role)) = row else {
        return Err(ChatError::Auth("invalid or expired credential".to_owned()));
    };

    Ok(Identity {
        user_id: Uuid::parse_str(&id)?,
        display_name,
        role: Role::parse(&role),
    })
}

pub async fn display_name(pool: &SqlitePool, user_id: Uuid) -> AppResult<String> {
    let row: Option<(String,)> = sqlx::query_as("SELECT display_name FROM users WHERE id=?")
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.map(|(name,)| name)
        .ok_or_else(|| ChatError::NotFound(format!("no such user {user_id}")))
}

/// Bearer-token extractor for the REST surface.
pub struct AuthUser(pub Identity);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    SqlitePool: FromRef<S>,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ChatError::Auth("missing bearer token".to_owned()))?;

        let pool = SqlitePool::from_ref(state);
        Ok(AuthUser(verify_token(&pool, token).await?))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(me))
        .route("/me/status", put(update_status))
}

#[debug_handler(state = AppState)]
async fn me(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
) -> AppResult<Response> {
    let (status, last_seen): (String, Option<i64>) =
        sqlx::query_as("SELECT status, last_seen_ms FROM users WHERE id=?")
            .bind(identity.user_id.to_string())
            .fetch_one(&db_pool)
            .await?;

    Ok(api_ok(json!({
        "id": identity.user_id,
        "display_name": identity.display_name,
        "role": identity.role,
        "status": status,
        "last_seen": last_seen,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct StatusBody {
    status: PresenceStatus,
}

#[debug_handler]
async fn update_status(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(StatusBody { status }): Json<StatusBody>,
) -> AppResult<Response> {
    let change = state.presence.set_status(identity.user_id, status)?;
    if let Some(change) = change {
        presence::broadcast_change(&state.db_pool, &state.hub, &change).await?;
    }
    Ok(api_ok(json!({ "status": status })).into_response())
}
