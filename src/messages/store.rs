use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, ChatError,
    auth::Identity,
    conversations::store as conversations,
    now_ms,
};

pub const PAGE_SIZE: i64 = 50;
pub const MAX_CONTENT_LEN: usize = 4000;
/// Non-admins may edit their own messages for this long after sending.
pub const EDIT_WINDOW_MS: i64 = 3 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    System,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Document => "document",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> MessageKind {
        match s {
            "image" => MessageKind::Image,
            "document" => MessageKind::Document,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub attachment: Option<String>,
    pub reactions: Vec<Reaction>,
    pub edited: bool,
    pub edited_at: Option<i64>,
    pub deleted: bool,
    pub seq: i64,
    pub created_at: i64,
}

type MsgRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    Option<i64>,
    bool,
    i64,
    i64,
);

const MSG_COLS: &str = "id,conversation_id,sender_id,kind,content,reply_to_id,attachment,\
                        edited,edited_at_ms,deleted,seq,created_at_ms";

fn parse_opt(id: Option<String>) -> AppResult<Option<Uuid>> {
    match id {
        Some(id) => Ok(Some(Uuid::parse_str(&id)?)),
        None => Ok(None),
    }
}

async fn from_row(pool: &SqlitePool, row: MsgRow) -> AppResult<Message> {
    let (
        id,
        conversation_id,
        sender_id,
        kind,
        content,
        reply_to_id,
        attachment,
        edited,
        edited_at,
        deleted,
        seq,
        created_at,
    ) = row;
    let id = Uuid::parse_str(&id)?;
    Ok(Message {
        id,
        conversation_id: Uuid::parse_str(&conversation_id)?,
        sender_id: parse_opt(sender_id)?,
        kind: MessageKind::parse(&kind),
        content,
        reply_to_id: parse_opt(reply_to_id)?,
        attachment,
        reactions: reactions_of(pool, id).await?,
        edited,
        edited_at,
        deleted,
        seq,
        created_at,
    })
}

pub async fn reactions_of(pool: &SqlitePool, message_id: Uuid) -> AppResult<Vec<Reaction>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT user_id, emoji FROM reactions WHERE message_id=? ORDER BY rowid")
            .bind(message_id.to_string())
            .fetch_all(pool)
            .await?;
    let mut reactions = Vec::with_capacity(rows.len());
    for (user_id, emoji) in rows {
        reactions.push(Reaction {
            user_id: Uuid::parse_str(&user_id)?,
            emoji,
        });
    }
    Ok(reactions)
}

pub async fn get(pool: &SqlitePool, message_id: Uuid) -> AppResult<Message> {
    let row: Option<MsgRow> =
        sqlx::query_as(&format!("SELECT {MSG_COLS} FROM messages WHERE id=?"))
            .bind(message_id.to_string())
            .fetch_optional(pool)
            .await?;
    let Some(row) = row else {
        return Err(ChatError::NotFound(format!("no such message {message_id}")));
    };
    from_row(pool, row).await
}

fn validate_content(content: &str) -> AppResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content must not be empty".to_owned()));
    }
    if trimmed.len() > MAX_CONTENT_LEN {
        return Err(ChatError::Validation(format!(
            "message content exceeds {MAX_CONTENT_LEN} bytes"
        )));
    }
    Ok(trimmed)
}

/// Inserts one row with a server-assigned id, timestamp and per-conversation
/// sequence number. The sequence is computed inside the INSERT itself, so two
/// concurrent appends cannot claim the same slot.
async fn insert(
    pool: &SqlitePool,
    conversation_id: Uuid,
    sender_id: Option<Uuid>,
    kind: MessageKind,
    content: &str,
    reply_to_id: Option<Uuid>,
    attachment: Option<&str>,
) -> AppResult<Message> {
    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO messages (id,conversation_id,seq,sender_id,kind,content,reply_to_id,attachment,created_at_ms) \
         VALUES (?,?,(SELECT COALESCE(MAX(seq),0)+1 FROM messages WHERE conversation_id=?),?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(conversation_id.to_string())
    .bind(conversation_id.to_string())
    .bind(sender_id.map(|s| s.to_string()))
    .bind(kind.as_str())
    .bind(content)
    .bind(reply_to_id.map(|r| r.to_string()))
    .bind(attachment)
    .bind(now_ms())
    .execute(pool)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at_ms=? WHERE id=?")
        .bind(now_ms())
        .bind(conversation_id.to_string())
        .execute(pool)
        .await?;

    get(pool, id).await
}

pub async fn append(
    pool: &SqlitePool,
    sender: &Identity,
    conversation_id: Uuid,
    content: &str,
    kind: MessageKind,
    reply_to_id: Option<Uuid>,
    attachment: Option<&str>,
) -> AppResult<Message> {
    if kind == MessageKind::System {
        return Err(ChatError::Validation(
            "clients cannot author system messages".to_owned(),
        ));
    }
    conversations::require_member(pool, conversation_id, sender.user_id).await?;
    let content = validate_content(content)?;

    if let Some(reply_to) = reply_to_id {
        let parent = get(pool, reply_to).await?;
        if parent.conversation_id != conversation_id {
            return Err(ChatError::Validation(
                "reply target is in another conversation".to_owned(),
            ));
        }
    }

    insert(
        pool,
        conversation_id,
        Some(sender.user_id),
        kind,
        content,
        reply_to_id,
        attachment,
    )
    .await
}

/// Platform-authored audit message, e.g. for membership changes.
pub async fn append_system(
    pool: &SqlitePool,
    conversation_id: Uuid,
    content: &str,
) -> AppResult<Message> {
    insert(
        pool,
        conversation_id,
        None,
        MessageKind::System,
        content,
        None,
        None,
    )
    .await
}

/// Sender themselves, a platform admin, or a conversation admin.
async fn can_moderate(pool: &SqlitePool, caller: &Identity, msg: &Message) -> AppResult<bool> {
    if msg.sender_id == Some(caller.user_id) || caller.is_admin() {
        return Ok(true);
    }
    conversations::is_conversation_admin(pool, msg.conversation_id, caller.user_id).await
}

pub async fn edit(
    pool: &SqlitePool,
    caller: &Identity,
    message_id: Uuid,
    new_content: &str,
) -> AppResult<Message> {
    let msg = get(pool, message_id).await?;
    if msg.deleted {
        return Err(ChatError::Conflict("message has been deleted".to_owned()));
    }
    let is_admin = caller.is_admin()
        || conversations::is_conversation_admin(pool, msg.conversation_id, caller.user_id).await?;
    if !is_admin && msg.sender_id != Some(caller.user_id) {
        return Err(ChatError::Permission(
            "only the sender or an admin may edit this message".to_owned(),
        ));
    }
    if !is_admin && now_ms() - msg.created_at > EDIT_WINDOW_MS {
        return Err(ChatError::Permission(
            "edit window has closed for this message".to_owned(),
        ));
    }
    let content = validate_content(new_content)?;

    let res = sqlx::query("UPDATE messages SET content=?, edited=1, edited_at_ms=? WHERE id=? AND deleted=0")
        .bind(content)
        .bind(now_ms())
        .bind(message_id.to_string())
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        // deleted in the window between the read and the update
        return Err(ChatError::Conflict("message has been deleted".to_owned()));
    }

    get(pool, message_id).await
}

/// Soft delete. Same authorization as edit, but with no age limit.
pub async fn delete(pool: &SqlitePool, caller: &Identity, message_id: Uuid) -> AppResult<Message> {
    let msg = get(pool, message_id).await?;
    if !can_moderate(pool, caller, &msg).await? {
        return Err(ChatError::Permission(
            "only the sender or an admin may delete this message".to_owned(),
        ));
    }
    sqlx::query("UPDATE messages SET deleted=1 WHERE id=?")
        .bind(message_id.to_string())
        .execute(pool)
        .await?;
    get(pool, message_id).await
}

/// Toggles (caller, emoji) in the reaction set. The INSERT and its conditional
/// inverse both key on the primary key, so concurrent toggles from different
/// users never clobber each other.
pub async fn react(
    pool: &SqlitePool,
    caller: &Identity,
    message_id: Uuid,
    emoji: &str,
) -> AppResult<Message> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.len() > 32 {
        return Err(ChatError::Validation("invalid emoji".to_owned()));
    }
    let msg = get(pool, message_id).await?;
    if msg.deleted {
        return Err(ChatError::Conflict("message has been deleted".to_owned()));
    }
    conversations::require_member(pool, msg.conversation_id, caller.user_id).await?;

    let res = sqlx::query("INSERT OR IGNORE INTO reactions (message_id,user_id,emoji) VALUES (?,?,?)")
        .bind(message_id.to_string())
        .bind(caller.user_id.to_string())
        .bind(emoji)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        sqlx::query("DELETE FROM reactions WHERE message_id=? AND user_id=? AND emoji=?")
            .bind(message_id.to_string())
            .bind(caller.user_id.to_string())
            .bind(emoji)
            .execute(pool)
            .await?;
    }

    get(pool, message_id).await
}

/// Stamps the caller's read position and validates the message belongs to the
/// conversation it claims to.
pub async fn mark_read(
    pool: &SqlitePool,
    caller: &Identity,
    conversation_id: Uuid,
    message_id: Uuid,
) -> AppResult<()> {
    conversations::require_member(pool, conversation_id, caller.user_id).await?;
    let msg = get(pool, message_id).await?;
    if msg.conversation_id != conversation_id {
        return Err(ChatError::Validation(
            "message does not belong to that conversation".to_owned(),
        ));
    }
    sqlx::query("UPDATE members SET last_read_id=? WHERE conversation_id=? AND user_id=?")
        .bind(message_id.to_string())
        .bind(conversation_id.to_string())
        .bind(caller.user_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

async fn rows_to_messages(pool: &SqlitePool, rows: Vec<MsgRow>) -> AppResult<Vec<Message>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(from_row(pool, row).await?);
    }
    Ok(out)
}

/// The reconciliation contract: everything sequenced strictly after
/// `after_seq`, ascending. Filter and ordering use the same monotone
/// per-conversation sequence, so a concurrent append is either fully visible
/// or arrives in a later poll, and a wall-clock step cannot hide a message.
pub async fn get_since(
    pool: &SqlitePool,
    conversation_id: Uuid,
    after_seq: i64,
) -> AppResult<Vec<Message>> {
    let rows: Vec<MsgRow> = sqlx::query_as(&format!(
        "SELECT {MSG_COLS} FROM messages WHERE conversation_id=? AND seq > ? ORDER BY seq ASC"
    ))
    .bind(conversation_id.to_string())
    .bind(after_seq)
    .fetch_all(pool)
    .await?;
    rows_to_messages(pool, rows).await
}

/// Newest-first pages, each returned in ascending order.
pub async fn get_page(
    pool: &SqlitePool,
    conversation_id: Uuid,
    page: i64,
) -> AppResult<Vec<Message>> {
    let offset = page.max(0).saturating_mul(PAGE_SIZE);
    let rows: Vec<MsgRow> = sqlx::query_as(&format!(
        "SELECT {MSG_COLS} FROM messages WHERE conversation_id=? ORDER BY seq DESC LIMIT ? OFFSET ?"
    ))
    .bind(conversation_id.to_string())
    .bind(PAGE_SIZE)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    let mut msgs = rows_to_messages(pool, rows).await?;
    msgs.reverse();
    Ok(msgs)
}
