use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ChatError,
    conversations::store::Conversation,
    messages::store::{Message, MessageKind, Reaction},
    realtime::presence::PresenceStatus,
};

/// Commands a client may issue over its channel. Everything except
/// `authenticate` requires a bound session, and every conversation-scoped
/// command is re-checked against membership before any store is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinConversations {
        conversation_ids: Vec<Uuid>,
    },
    SendMessage {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        reply_to_id: Option<Uuid>,
        #[serde(default)]
        attachment: Option<String>,
    },
    EditMessage {
        message_id: Uuid,
        content: String,
    },
    DeleteMessage {
        message_id: Uuid,
    },
    React {
        message_id: Uuid,
        emoji: String,
    },
    MarkMessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    TypingStart {
        conversation_id: Uuid,
    },
    TypingStop {
        conversation_id: Uuid,
    },
    UpdateStatus {
        status: PresenceStatus,
    },
}

/// Events pushed to clients. Delivery is at-least-once per connected session;
/// clients deduplicate messages by id against their own reconciliation poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        user_id: Uuid,
    },
    NewMessage {
        message: Message,
    },
    MessageEdited {
        message_id: Uuid,
        conversation_id: Uuid,
        content: String,
        edited_at: Option<i64>,
    },
    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
    },
    MessageReactionUpdated {
        message_id: Uuid,
        conversation_id: Uuid,
        reactions: Vec<Reaction>,
    },
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    },
    UserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    UserStopTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    UserStatusChanged {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: Option<i64>,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn from_error(err: &ChatError) -> ServerEvent {
        ServerEvent::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}
