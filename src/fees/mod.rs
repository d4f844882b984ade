use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{AppResult, AppState, ChatError, api_ok, auth::AuthUser, now_ms};

#[derive(Debug, Serialize)]
struct FeeRecord {
    id: Uuid,
    user_id: Uuid,
    description: String,
    amount_cents: i64,
    due: Option<i64>,
    paid: bool,
    paid_at: Option<i64>,
    created_at: i64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_all).post(create))
        .route("/mine", get(list_mine))
        .route("/{id}/pay", post(mark_paid))
}

type FeeRow = (String, String, String, i64, Option<i64>, bool, Option<i64>, i64);

const FEE_COLS: &str = "id,user_id,description,amount_cents,due_ms,paid,paid_at_ms,created_at_ms";

fn fee_from_row(row: FeeRow) -> AppResult<FeeRecord> {
    let (id, user_id, description, amount_cents, due, paid, paid_at, created_at) = row;
    Ok(FeeRecord {
        id: Uuid::parse_str(&id)?,
        user_id: Uuid::parse_str(&user_id)?,
        description,
        amount_cents,
        due,
        paid,
        paid_at,
        created_at,
    })
}

#[debug_handler(state = AppState)]
async fn list_all(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may list all fees".to_owned()));
    }
    let rows: Vec<FeeRow> = sqlx::query_as(&format!(
        "SELECT {FEE_COLS} FROM fee_records ORDER BY created_at_ms DESC"
    ))
    .fetch_all(&db_pool)
    .await?;
    let fees: AppResult<Vec<FeeRecord>> = rows.into_iter().map(fee_from_row).collect();
    Ok(api_ok(fees?).into_response())
}

#[debug_handler(state = AppState)]
async fn list_mine(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
) -> AppResult<Response> {
    let rows: Vec<FeeRow> = sqlx::query_as(&format!(
        "SELECT {FEE_COLS} FROM fee_records WHERE user_id=? ORDER BY created_at_ms DESC"
    ))
    .bind(identity.user_id.to_string())
    .fetch_all(&db_pool)
    .await?;
    let fees: AppResult<Vec<FeeRecord>> = rows.into_iter().map(fee_from_row).collect();
    Ok(api_ok(fees?).into_response())
}

#[derive(Deserialize)]
struct FeeBody {
    user_id: Uuid,
    description: String,
    amount_cents: i64,
    #[serde(default)]
    due: Option<i64>,
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Json(body): Json<FeeBody>,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may create fee records".to_owned()));
    }
    if body.amount_cents <= 0 {
        return Err(ChatError::Validation("amount must be positive".to_owned()));
    }
    if body.description.trim().is_empty() {
        return Err(ChatError::Validation("description is required".to_owned()));
    }
    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO fee_records (id,user_id,description,amount_cents,due_ms,created_at_ms) VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(body.user_id.to_string())
    .bind(body.description.trim())
    .bind(body.amount_cents)
    .bind(body.due)
    .bind(now_ms())
    .execute(&db_pool)
    .await?;
    Ok(api_ok(serde_json::json!({ "id": id })).into_response())
}

#[debug_handler(state = AppState)]
async fn mark_paid(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may settle fees".to_owned()));
    }
    let res = sqlx::query("UPDATE fee_records SET paid=1, paid_at_ms=? WHERE id=? AND paid=0")
        .bind(now_ms())
        .bind(id.to_string())
        .execute(&db_pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::Conflict(format!("fee {id} is missing or already paid")));
    }
    Ok(api_ok(serde_json::json!({ "paid": id })).into_response())
}
