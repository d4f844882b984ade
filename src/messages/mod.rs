pub mod store;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{patch, post},
};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, AppState, api_ok,
    auth::AuthUser,
    conversations::store as conversations,
    realtime::{hub::Hub, protocol::ServerEvent},
};

use store::{Message, MessageKind};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", patch(edit).delete(remove))
        .route("/{id}/reactions", post(react))
        .route("/{id}/read", post(mark_read))
}

pub(crate) fn notify_new(hub: &Hub, message: &Message) {
    hub.broadcast_to_room(
        message.conversation_id,
        &ServerEvent::NewMessage {
            message: message.clone(),
        },
    );
}

pub(crate) fn notify_edited(hub: &Hub, message: &Message) {
    hub.broadcast_to_room(
        message.conversation_id,
        &ServerEvent::MessageEdited {
            message_id: message.id,
            conversation_id: message.conversation_id,
            content: message.content.clone(),
            edited_at: message.edited_at,
        },
    );
}

pub(crate) fn notify_deleted(hub: &Hub, message: &Message) {
    hub.broadcast_to_room(
        message.conversation_id,
        &ServerEvent::MessageDeleted {
            message_id: message.id,
            conversation_id: message.conversation_id,
        },
    );
}

pub(crate) fn notify_reactions(hub: &Hub, message: &Message) {
    hub.broadcast_to_room(
        message.conversation_id,
        &ServerEvent::MessageReactionUpdated {
            message_id: message.id,
            conversation_id: message.conversation_id,
            reactions: message.reactions.clone(),
        },
    );
}

pub(crate) fn notify_read(hub: &Hub, conversation_id: Uuid, message_id: Uuid, user_id: Uuid) {
    hub.broadcast_to_room(
        conversation_id,
        &ServerEvent::MessageRead {
            conversation_id,
            message_id,
            user_id,
        },
    );
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: i64,
}

#[debug_handler(state = AppState)]
pub async fn page_in_conversation(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(PageQuery { page }): Query<PageQuery>,
) -> AppResult<Response> {
    conversations::require_member(&db_pool, conversation_id, identity.user_id).await?;
    let messages = store::get_page(&db_pool, conversation_id, page).await?;
    Ok(api_ok(messages).into_response())
}

#[derive(Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub after: i64,
}

/// The reconciliation endpoint. `after` is a sequence cursor: everything the
/// conversation sequenced strictly after it, in that same order.
#[debug_handler(state = AppState)]
pub async fn since_in_conversation(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(SinceQuery { after }): Query<SinceQuery>,
) -> AppResult<Response> {
    conversations::require_member(&db_pool, conversation_id, identity.user_id).await?;
    let messages = store::get_since(&db_pool, conversation_id, after).await?;
    Ok(api_ok(messages).into_response())
}

#[derive(Deserialize)]
pub struct SendBody {
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub attachment: Option<String>,
}

#[debug_handler]
pub async fn send_to_conversation(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<SendBody>,
) -> AppResult<Response> {
    let msg = store::append(
        &state.db_pool,
        &identity,
        conversation_id,
        &body.content,
        body.kind,
        body.reply_to_id,
        body.attachment.as_deref(),
    )
    .await?;
    notify_new(&state.hub, &msg);
    Ok(api_ok(msg).into_response())
}

#[derive(Deserialize)]
struct EditBody {
    content: String,
}

#[debug_handler]
async fn edit(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<Uuid>,
    Json(EditBody { content }): Json<EditBody>,
) -> AppResult<Response> {
    let msg = store::edit(&state.db_pool, &identity, message_id, &content).await?;
    notify_edited(&state.hub, &msg);
    Ok(api_ok(msg).into_response())
}

#[debug_handler]
async fn remove(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<Response> {
    let msg = store::delete(&state.db_pool, &identity, message_id).await?;
    notify_deleted(&state.hub, &msg);
    Ok(api_ok(serde_json::json!({ "deleted": msg.id })).into_response())
}

#[derive(Deserialize)]
struct ReactBody {
    emoji: String,
}

#[debug_handler]
async fn react(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<Uuid>,
    Json(ReactBody { emoji }): Json<ReactBody>,
) -> AppResult<Response> {
    let msg = store::react(&state.db_pool, &identity, message_id, &emoji).await?;
    notify_reactions(&state.hub, &msg);
    Ok(api_ok(msg.reactions).into_response())
}

#[derive(Deserialize)]
struct ReadBody {
    conversation_id: Uuid,
}

#[debug_handler]
async fn mark_read(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<Uuid>,
    Json(ReadBody { conversation_id }): Json<ReadBody>,
) -> AppResult<Response> {
    store::mark_read(&state.db_pool, &identity, conversation_id, message_id).await?;
    notify_read(&state.hub, conversation_id, message_id, identity.user_id);
    Ok(api_ok(serde_json::json!({ "read": message_id })).into_response())
}
