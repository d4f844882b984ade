use axum::{
    Json, Router, debug_handler,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{AppResult, AppState, ChatError, api_ok, auth::AuthUser, now_ms};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list).post(create))
}

#[debug_handler(state = AppState)]
async fn list(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may list donations".to_owned()));
    }
    let rows: Vec<(String, Option<String>, String, i64, Option<String>, i64)> = sqlx::query_as(
        "SELECT id,donor_id,donor_name,amount_cents,note,created_at_ms \
         FROM donations ORDER BY created_at_ms DESC",
    )
    .fetch_all(&db_pool)
    .await?;
    let donations: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, donor_id, donor_name, amount_cents, note, created_at)| {
            serde_json::json!({
                "id": id,
                "donor_id": donor_id,
                "donor_name": donor_name,
                "amount_cents": amount_cents,
                "note": note,
                "created_at": created_at,
            })
        })
        .collect();
    Ok(api_ok(donations).into_response())
}

#[derive(Deserialize)]
struct DonationBody {
    #[serde(default)]
    donor_name: Option<String>,
    amount_cents: i64,
    #[serde(default)]
    note: Option<String>,
}

/// Payment processing itself is an external collaborator; this records the
/// outcome only.
#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Json(body): Json<DonationBody>,
) -> AppResult<Response> {
    if body.amount_cents <= 0 {
        return Err(ChatError::Validation("amount must be positive".to_owned()));
    }
    let donor_name = body
        .donor_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&identity.display_name)
        .to_owned();
    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO donations (id,donor_id,donor_name,amount_cents,note,created_at_ms) VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(identity.user_id.to_string())
    .bind(&donor_name)
    .bind(body.amount_cents)
    .bind(body.note.as_deref())
    .bind(now_ms())
    .execute(&db_pool)
    .await?;
    Ok(api_ok(serde_json::json!({ "id": id })).into_response())
}
