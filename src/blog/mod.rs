use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{AppResult, AppState, ChatError, api_ok, auth::AuthUser, now_ms};

#[derive(Debug, Serialize)]
struct Post {
    id: Uuid,
    author_id: Uuid,
    title: String,
    body_md: String,
    created_at: i64,
    updated_at: i64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(fetch).patch(update).delete(remove))
        .route("/{id}/html", get(rendered))
        .route("/{id}/comments", get(list_comments).post(create_comment))
}

type PostRow = (String, String, String, String, i64, i64);

fn post_from_row(row: PostRow) -> AppResult<Post> {
    let (id, author_id, title, body_md, created_at, updated_at) = row;
    Ok(Post {
        id: Uuid::parse_str(&id)?,
        author_id: Uuid::parse_str(&author_id)?,
        title,
        body_md,
        created_at,
        updated_at,
    })
}

async fn fetch_post(pool: &SqlitePool, id: Uuid) -> AppResult<Post> {
    let row: Option<PostRow> = sqlx::query_as(
        "SELECT id,author_id,title,body_md,created_at_ms,updated_at_ms FROM posts WHERE id=?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(ChatError::NotFound(format!("no such post {id}")));
    };
    post_from_row(row)
}

#[debug_handler(state = AppState)]
async fn list(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
) -> AppResult<Response> {
    let rows: Vec<PostRow> = sqlx::query_as(
        "SELECT id,author_id,title,body_md,created_at_ms,updated_at_ms \
         FROM posts ORDER BY created_at_ms DESC",
    )
    .fetch_all(&db_pool)
    .await?;
    let posts: AppResult<Vec<Post>> = rows.into_iter().map(post_from_row).collect();
    Ok(api_ok(posts?).into_response())
}

#[debug_handler(state = AppState)]
async fn fetch(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    Ok(api_ok(fetch_post(&db_pool, id).await?).into_response())
}

#[debug_handler(state = AppState)]
async fn rendered(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let post = fetch_post(&db_pool, id).await?;
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, pulldown_cmark::Parser::new(&post.body_md));
    Ok(Html(html).into_response())
}

#[derive(Deserialize)]
struct PostBody {
    title: String,
    body_md: String,
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Json(body): Json<PostBody>,
) -> AppResult<Response> {
    if body.title.trim().is_empty() || body.body_md.trim().is_empty() {
        return Err(ChatError::Validation("title and body are required".to_owned()));
    }
    let id = Uuid::now_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO posts (id,author_id,title,body_md,created_at_ms,updated_at_ms) VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(identity.user_id.to_string())
    .bind(body.title.trim())
    .bind(&body.body_md)
    .bind(now)
    .bind(now)
    .execute(&db_pool)
    .await?;
    Ok(api_ok(fetch_post(&db_pool, id).await?).into_response())
}

fn require_author_or_admin(post: &Post, identity: &crate::auth::Identity) -> AppResult<()> {
    if post.author_id != identity.user_id && !identity.is_admin() {
        return Err(ChatError::Permission(
            "only the author or an admin may modify this post".to_owned(),
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
struct PostPatch {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body_md: Option<String>,
}

#[debug_handler(state = AppState)]
async fn update(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<PostPatch>,
) -> AppResult<Response> {
    let post = fetch_post(&db_pool, id).await?;
    require_author_or_admin(&post, &identity)?;
    sqlx::query(
        "UPDATE posts SET title=COALESCE(?,title), body_md=COALESCE(?,body_md), updated_at_ms=? WHERE id=?",
    )
    .bind(body.title.as_deref().map(str::trim))
    .bind(body.body_md.as_deref())
    .bind(now_ms())
    .bind(id.to_string())
    .execute(&db_pool)
    .await?;
    Ok(api_ok(fetch_post(&db_pool, id).await?).into_response())
}

#[debug_handler(state = AppState)]
async fn remove(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let post = fetch_post(&db_pool, id).await?;
    require_author_or_admin(&post, &identity)?;
    sqlx::query("DELETE FROM comments WHERE post_id=?")
        .bind(id.to_string())
        .execute(&db_pool)
        .await?;
    sqlx::query("DELETE FROM posts WHERE id=?")
        .bind(id.to_string())
        .execute(&db_pool)
        .await?;
    Ok(api_ok(serde_json::json!({ "deleted": id })).into_response())
}

#[debug_handler(state = AppState)]
async fn list_comments(
    State(db_pool): State<SqlitePool>,
    AuthUser(_identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
        "SELECT id,author_id,body,created_at_ms FROM comments WHERE post_id=? ORDER BY created_at_ms",
    )
    .bind(id.to_string())
    .fetch_all(&db_pool)
    .await?;
    let comments: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, author_id, body, created_at)| {
            serde_json::json!({
                "id": id, "author_id": author_id, "body": body, "created_at": created_at,
            })
        })
        .collect();
    Ok(api_ok(comments).into_response())
}

#[derive(Deserialize)]
struct CommentBody {
    body: String,
}

#[debug_handler(state = AppState)]
async fn create_comment(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
    Json(CommentBody { body }): Json<CommentBody>,
) -> AppResult<Response> {
    if body.trim().is_empty() {
        return Err(ChatError::Validation("comment body is required".to_owned()));
    }
    // ensure the post exists first
    fetch_post(&db_pool, id).await?;
    let comment_id = Uuid::now_v7();
    sqlx::query("INSERT INTO comments (id,post_id,author_id,body,created_at_ms) VALUES (?,?,?,?,?)")
        .bind(comment_id.to_string())
        .bind(id.to_string())
        .bind(identity.user_id.to_string())
        .bind(body.trim())
        .bind(now_ms())
        .execute(&db_pool)
        .await?;
    Ok(api_ok(serde_json::json!({ "id": comment_id })).into_response())
}
