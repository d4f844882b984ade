use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{AppResult, AppState, ChatError, api_ok, auth::AuthUser, now_ms};

#[derive(Debug, Serialize)]
struct Document {
    id: Uuid,
    title: String,
    category_id: Option<Uuid>,
    uploader_id: Uuid,
    location: String,
    created_at: i64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(fetch).delete(remove))
        .route("/categories", get(list_categories).post(create_category))
}

type DocRow = (String, String, Option<String>, String, String, i64);

fn doc_from_row(row: DocRow) -> AppResult<Document> {
    let (id, title, category_id, uploader_id, location, created_at) = row;
    Ok(Document {
        id: Uuid::parse_str(&id)?,
        title,
        category_id: match category_id {
            Some(c) => Some(Uuid::parse_str(&c)?),
            None => None,
        },
        uploader_id: Uuid::parse_str(&uploader_id)?,
        location,
        created_at,
    })
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    category: Option<Uuid>,
}

#[debug_handler(state = AppState)]
async fn list(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Query(ListQuery { category }): Query<ListQuery>,
) -> AppResult<Response> {
    let rows: Vec<DocRow> = match category {
        Some(category) => {
            sqlx::query_as(
                "SELECT id,title,category_id,uploader_id,location,created_at_ms \
                 FROM documents WHERE category_id=? ORDER BY created_at_ms DESC",
            )
            .bind(category.to_string())
            .fetch_all(&db_pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id,title,category_id,uploader_id,location,created_at_ms \
                 FROM documents ORDER BY created_at_ms DESC",
            )
            .fetch_all(&db_pool)
            .await?
        }
    };
    let docs: AppResult<Vec<Document>> = rows.into_iter().map(doc_from_row).collect();
    Ok(api_ok(docs?).into_response())
}

#[debug_handler(state = AppState)]
async fn fetch(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let row: Option<DocRow> = sqlx::query_as(
        "SELECT id,title,category_id,uploader_id,location,created_at_ms FROM documents WHERE id=?",
    )
    .bind(id.to_string())
    .fetch_optional(&db_pool)
    .await?;
    let Some(row) = row else {
        return Err(ChatError::NotFound(format!("no such document {id}")));
    };
    Ok(api_ok(doc_from_row(row)?).into_response())
}

#[derive(Deserialize)]
struct CreateBody {
    title: String,
    #[serde(default)]
    category_id: Option<Uuid>,
    location: String,
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Json(body): Json<CreateBody>,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may add documents".to_owned()));
    }
    if body.title.trim().is_empty() || body.location.trim().is_empty() {
        return Err(ChatError::Validation("title and location are required".to_owned()));
    }
    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO documents (id,title,category_id,uploader_id,location,created_at_ms) VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(body.title.trim())
    .bind(body.category_id.map(|c| c.to_string()))
    .bind(identity.user_id.to_string())
    .bind(body.location.trim())
    .bind(now_ms())
    .execute(&db_pool)
    .await?;
    Ok(api_ok(serde_json::json!({ "id": id })).into_response())
}

#[debug_handler(state = AppState)]
async fn remove(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may remove documents".to_owned()));
    }
    let res = sqlx::query("DELETE FROM documents WHERE id=?")
        .bind(id.to_string())
        .execute(&db_pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::NotFound(format!("no such document {id}")));
    }
    Ok(api_ok(serde_json::json!({ "deleted": id })).into_response())
}

#[debug_handler(state = AppState)]
async fn list_categories(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
) -> AppResult<Response> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT id,name FROM categories ORDER BY name")
            .fetch_all(&db_pool)
            .await?;
    let categories: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, name)| serde_json::json!({ "id": id, "name": name }))
        .collect();
    Ok(api_ok(categories).into_response())
}

#[derive(Deserialize)]
struct CategoryBody {
    name: String,
}

#[debug_handler(state = AppState)]
async fn create_category(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Json(CategoryBody { name }): Json<CategoryBody>,
) -> AppResult<Response> {
    if !identity.is_admin() {
        return Err(ChatError::Permission("only admins may add categories".to_owned()));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::Validation("category name is required".to_owned()));
    }
    let id = Uuid::now_v7();
    let res = sqlx::query("INSERT OR IGNORE INTO categories (id,name) VALUES (?,?)")
        .bind(id.to_string())
        .bind(name)
        .execute(&db_pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ChatError::Conflict(format!("category {name} already exists")));
    }
    Ok(api_ok(serde_json::json!({ "id": id, "name": name })).into_response())
}
