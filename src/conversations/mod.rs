pub mod store;

use std::collections::HashSet;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, AppState, api_ok,
    auth::AuthUser,
    messages,
    realtime::{hub::Hub, protocol::ServerEvent},
};

use store::Conversation;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/private", post(create_private))
        .route("/group", post(create_group))
        .route("/{id}", axum::routing::patch(update_group).delete(delete_group))
        .route("/{id}/members", post(add_members).delete(remove_members))
        .route("/{id}/typing", get(typing_users))
        .route(
            "/{id}/messages",
            get(messages::page_in_conversation).post(messages::send_to_conversation),
        )
        .route("/{id}/messages/since", get(messages::since_in_conversation))
}

pub(crate) fn notify_updated(hub: &Hub, conversation: &Conversation) {
    hub.broadcast_to_room(
        conversation.id,
        &ServerEvent::ConversationUpdated {
            conversation: conversation.clone(),
        },
    );
}

/// For conversations whose members may not be subscribed yet (fresh private
/// chats, fresh groups): deliver to the members' sessions directly.
fn notify_members_directly(hub: &Hub, conversation: &Conversation) {
    let members: HashSet<Uuid> = conversation.members.iter().map(|m| m.user_id).collect();
    hub.send_to_users(
        &members,
        &ServerEvent::ConversationUpdated {
            conversation: conversation.clone(),
        },
    );
}

#[debug_handler(state = AppState)]
async fn list(
    State(db_pool): State<SqlitePool>,
    AuthUser(identity): AuthUser,
) -> AppResult<Response> {
    let conversations = store::list_for_user(&db_pool, identity.user_id).await?;
    Ok(api_ok(conversations).into_response())
}

#[derive(Deserialize)]
struct PrivateBody {
    peer_id: Uuid,
}

#[debug_handler]
async fn create_private(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(PrivateBody { peer_id }): Json<PrivateBody>,
) -> AppResult<Response> {
    let conv = store::create_private(&state.db_pool, &identity, peer_id).await?;
    state.hub.add_user_to_room(conv.id, identity.user_id);
    state.hub.add_user_to_room(conv.id, peer_id);
    notify_members_directly(&state.hub, &conv);
    Ok(api_ok(conv).into_response())
}

#[derive(Deserialize)]
struct GroupBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    participant_ids: Vec<Uuid>,
}

#[debug_handler]
async fn create_group(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(body): Json<GroupBody>,
) -> AppResult<Response> {
    let conv = store::create_group(
        &state.db_pool,
        &identity,
        &body.name,
        body.description.as_deref(),
        &body.participant_ids,
    )
    .await?;
    for member in &conv.members {
        state.hub.add_user_to_room(conv.id, member.user_id);
    }
    notify_members_directly(&state.hub, &conv);
    Ok(api_ok(conv).into_response())
}

#[derive(Deserialize)]
struct GroupPatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[debug_handler]
async fn update_group(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
    Json(body): Json<GroupPatch>,
) -> AppResult<Response> {
    let conv = store::update_group(
        &state.db_pool,
        &identity,
        id,
        body.name.as_deref(),
        body.description.as_deref(),
    )
    .await?;
    notify_updated(&state.hub, &conv);
    Ok(api_ok(conv).into_response())
}

#[derive(Deserialize)]
struct MembersBody {
    user_ids: Vec<Uuid>,
}

#[debug_handler]
async fn add_members(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
    Json(MembersBody { user_ids }): Json<MembersBody>,
) -> AppResult<Response> {
    let (conv, audit) = store::add_members(&state.db_pool, &identity, id, &user_ids).await?;
    for &user_id in &user_ids {
        state.hub.add_user_to_room(id, user_id);
    }
    for msg in &audit {
        messages::notify_new(&state.hub, msg);
    }
    notify_updated(&state.hub, &conv);
    Ok(api_ok(conv).into_response())
}

#[debug_handler]
async fn remove_members(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
    Json(MembersBody { user_ids }): Json<MembersBody>,
) -> AppResult<Response> {
    let (conv, removed, audit) =
        store::remove_members(&state.db_pool, &identity, id, &user_ids).await?;
    for msg in &audit {
        messages::notify_new(&state.hub, msg);
    }
    // evict after the audit fanout so remaining members still get it, then
    // make sure the removed users hear about the membership change once
    for &user_id in &removed {
        state.hub.evict_user(id, user_id);
    }
    notify_updated(&state.hub, &conv);
    let removed_set: HashSet<Uuid> = removed.into_iter().collect();
    state.hub.send_to_users(
        &removed_set,
        &ServerEvent::ConversationUpdated {
            conversation: conv.clone(),
        },
    );
    Ok(api_ok(conv).into_response())
}

#[debug_handler]
async fn delete_group(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    store::delete_group(&state.db_pool, &identity, id).await?;
    state.hub.drop_room(id);
    Ok(api_ok(serde_json::json!({ "deleted": id })).into_response())
}

#[debug_handler]
async fn typing_users(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    store::require_member(&state.db_pool, id, identity.user_id).await?;
    let users: Vec<serde_json::Value> = state
        .typing
        .typing_users(id)
        .into_iter()
        .map(|(user_id, user_name)| {
            serde_json::json!({ "user_id": user_id, "user_name": user_name })
        })
        .collect();
    Ok(api_ok(users).into_response())
}
