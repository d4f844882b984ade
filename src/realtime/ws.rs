use std::time::Duration;

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::{SplitSink, SplitStream}};
use tracing::{debug, info, warn};

use crate::{
    AppResult, AppState, ChatError,
    auth::{self, Identity},
    conversations::{self, store as conv_store},
    messages::{self, store as msg_store},
    realtime::{
        hub::SessionId,
        presence,
        protocol::{ClientEvent, ServerEvent},
    },
};

/// The first frame must authenticate within this bound or the channel drops.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[debug_handler]
pub async fn chat_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let identity =
        match tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&mut receiver, &state)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(err)) => {
                debug!(%err, "channel rejected");
                send_now(&mut sender, &ServerEvent::from_error(&err)).await;
                return;
            }
            Err(_) => {
                debug!("channel authentication timed out");
                return;
            }
        };

    // First connect counts as joining the default group.
    let joined = match conv_store::join_default_group(&state.db_pool, &identity).await {
        Ok(joined) => joined,
        Err(err) => {
            warn!(%err, "default group join failed");
            None
        }
    };

    let (session_id, mut rx) = state.hub.register(identity.user_id);

    // Subscribe to every current conversation before anything else can be
    // missed between connect and an explicit join command.
    match conv_store::conversation_ids_for(&state.db_pool, identity.user_id).await {
        Ok(ids) => state.hub.join_rooms(session_id, &ids),
        Err(err) => warn!(%err, "initial room subscription failed"),
    }

    if let Some(msg) = joined {
        messages::notify_new(&state.hub, &msg);
        if let Ok(conv) = conv_store::get(&state.db_pool, msg.conversation_id).await {
            conversations::notify_updated(&state.hub, &conv);
        }
    }

    if let Some(change) = state.presence.connected(identity.user_id) {
        if let Err(err) = presence::broadcast_change(&state.db_pool, &state.hub, &change).await {
            warn!(%err, "presence broadcast failed");
        }
    }

    state.hub.send_to_session(
        session_id,
        &ServerEvent::Authenticated {
            user_id: identity.user_id,
        },
    );
    info!(user = %identity.user_id, %session_id, "channel open");

    let outbox = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(err) => {
                state
                    .hub
                    .send_to_session(session_id, &ServerEvent::from_error(&err.into()));
                continue;
            }
        };
        // Command failures answer the originating session only and never
        // close the channel.
        if let Err(err) = dispatch(&state, session_id, &identity, event).await {
            state
                .hub
                .send_to_session(session_id, &ServerEvent::from_error(&err));
        }
    }

    outbox.abort();
    state.hub.unregister(session_id);
    if let Some(epoch) = state.presence.disconnected(identity.user_id) {
        presence::schedule_offline(
            state.presence.clone(),
            state.db_pool.clone(),
            state.hub.clone(),
            identity.user_id,
            epoch,
        );
    }
    info!(user = %identity.user_id, %session_id, "channel closed");
}

async fn send_now(sender: &mut SplitSink<WebSocket, WsMessage>, event: &ServerEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = sender.send(WsMessage::Text(text.into())).await;
    }
}

async fn wait_for_auth(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> AppResult<Identity> {
    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let event: ClientEvent = serde_json::from_str(&text)
            .map_err(|_| ChatError::Auth("expected an authenticate event".to_owned()))?;
        let ClientEvent::Authenticate { token } = event else {
            return Err(ChatError::Auth("expected an authenticate event".to_owned()));
        };
        return auth::verify_token(&state.db_pool, &token).await;
    }
    Err(ChatError::Auth("channel closed before authentication".to_owned()))
}

async fn dispatch(
    state: &AppState,
    session_id: SessionId,
    identity: &Identity,
    event: ClientEvent,
) -> AppResult<()> {
    let pool = &state.db_pool;
    match event {
        ClientEvent::Authenticate { .. } => {
            // already bound; nothing to do
            Ok(())
        }
        ClientEvent::JoinConversations { conversation_ids } => {
            for &conversation_id in &conversation_ids {
                conv_store::require_member(pool, conversation_id, identity.user_id).await?;
            }
            state.hub.join_rooms(session_id, &conversation_ids);
            Ok(())
        }
        ClientEvent::SendMessage {
            conversation_id,
            content,
            kind,
            reply_to_id,
            attachment,
        } => {
            let msg = msg_store::append(
                pool,
                identity,
                conversation_id,
                &content,
                kind,
                reply_to_id,
                attachment.as_deref(),
            )
            .await?;
            messages::notify_new(&state.hub, &msg);
            Ok(())
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => {
            let msg = msg_store::edit(pool, identity, message_id, &content).await?;
            messages::notify_edited(&state.hub, &msg);
            Ok(())
        }
        ClientEvent::DeleteMessage { message_id } => {
            let msg = msg_store::delete(pool, identity, message_id).await?;
            messages::notify_deleted(&state.hub, &msg);
            Ok(())
        }
        ClientEvent::React { message_id, emoji } => {
            let msg = msg_store::react(pool, identity, message_id, &emoji).await?;
            messages::notify_reactions(&state.hub, &msg);
            Ok(())
        }
        ClientEvent::MarkMessageRead {
            conversation_id,
            message_id,
        } => {
            msg_store::mark_read(pool, identity, conversation_id, message_id).await?;
            messages::notify_read(&state.hub, conversation_id, message_id, identity.user_id);
            Ok(())
        }
        ClientEvent::TypingStart { conversation_id } => {
            conv_store::require_member(pool, conversation_id, identity.user_id).await?;
            if state
                .typing
                .start(conversation_id, identity.user_id, &identity.display_name)
            {
                state.hub.broadcast_to_room(
                    conversation_id,
                    &ServerEvent::UserTyping {
                        conversation_id,
                        user_id: identity.user_id,
                        user_name: identity.display_name.clone(),
                    },
                );
            }
            Ok(())
        }
        ClientEvent::TypingStop { conversation_id } => {
            conv_store::require_member(pool, conversation_id, identity.user_id).await?;
            if state.typing.stop(conversation_id, identity.user_id) {
                state.hub.broadcast_to_room(
                    conversation_id,
                    &ServerEvent::UserStopTyping {
                        conversation_id,
                        user_id: identity.user_id,
                        user_name: identity.display_name.clone(),
                    },
                );
            }
            Ok(())
        }
        ClientEvent::UpdateStatus { status } => {
            if let Some(change) = state.presence.set_status(identity.user_id, status)? {
                presence::broadcast_change(pool, &state.hub, &change).await?;
            }
            Ok(())
        }
    }
}
