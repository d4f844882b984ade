use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, ChatError,
    auth::{self, Identity, Role},
    messages::store as messages,
    now_ms,
};

/// `private_key` sentinel for the seeded default group everyone lands in.
pub const DEFAULT_GROUP_KEY: &str = "default-group";
pub const DEFAULT_GROUP_NAME: &str = "General";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Private,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Group => "group",
            ConversationKind::Private => "private",
        }
    }

    pub fn parse(s: &str) -> ConversationKind {
        match s {
            "private" => ConversationKind::Private,
            _ => ConversationKind::Group,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub display_name: String,
    pub member_role: Role,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub creator_id: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
    pub members: Vec<Member>,
}

type ConvRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
);

const CONV_COLS: &str = "id,kind,name,description,creator_id,created_at_ms,updated_at_ms";

async fn from_row(pool: &SqlitePool, row: ConvRow) -> AppResult<Conversation> {
    let (id, kind, name, description, creator_id, created_at, updated_at) = row;
    let id = Uuid::parse_str(&id)?;
    Ok(Conversation {
        id,
        kind: ConversationKind::parse(&kind),
        name,
        description,
        creator_id: match creator_id {
            Some(c) => Some(Uuid::parse_str(&c)?),
            None => None,
        },
        created_at,
        updated_at,
        members: members_of(pool, id).await?,
    })
}

pub async fn members_of(pool: &SqlitePool, conversation_id: Uuid) -> AppResult<Vec<Member>> {
    let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
        "SELECT m.user_id, u.display_name, m.member_role, m.joined_at_ms \
         FROM members m JOIN users u ON u.id = m.user_id \
         WHERE m.conversation_id=? ORDER BY m.joined_at_ms, m.user_id",
    )
    .bind(conversation_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut members = Vec::with_capacity(rows.len());
    for (user_id, display_name, member_role, joined_at) in rows {
        members.push(Member {
            user_id: Uuid::parse_str(&user_id)?,
            display_name,
            member_role: Role::parse(&member_role),
            joined_at,
        });
    }
    Ok(members)
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> AppResult<Conversation> {
    let row: Option<ConvRow> =
        sqlx::query_as(&format!("SELECT {CONV_COLS} FROM conversations WHERE id=?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;
    let Some(row) = row else {
        return Err(ChatError::NotFound(format!("no such conversation {id}")));
    };
    from_row(pool, row).await
}

pub async fn list_for_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<Vec<Conversation>> {
    let rows: Vec<ConvRow> = sqlx::query_as(&format!(
        "SELECT {CONV_COLS} FROM conversations \
         WHERE id IN (SELECT conversation_id FROM members WHERE user_id=?) \
         ORDER BY updated_at_ms DESC"
    ))
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(from_row(pool, row).await?);
    }
    Ok(out)
}

pub async fn conversation_ids_for(pool: &SqlitePool, user_id: Uuid) -> AppResult<Vec<Uuid>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT conversation_id FROM members WHERE user_id=?")
        .bind(user_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|(id,)| Uuid::parse_str(&id).map_err(ChatError::from))
        .collect()
}

pub async fn is_member(pool: &SqlitePool, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM members WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub async fn require_member(
    pool: &SqlitePool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<()> {
    if is_member(pool, conversation_id, user_id).await? {
        Ok(())
    } else {
        Err(ChatError::Permission(
            "not a member of this conversation".to_owned(),
        ))
    }
}

pub async fn is_conversation_admin(
    pool: &SqlitePool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT member_role FROM members WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;
    Ok(matches!(row, Some((role,)) if Role::parse(&role) == Role::Admin))
}

/// Group mutations need a platform admin or a conversation admin, and the
/// target must actually be a group. Checked before any write.
async fn require_group_admin(
    pool: &SqlitePool,
    conversation_id: Uuid,
    caller: &Identity,
) -> AppResult<Conversation> {
    let conv = get(pool, conversation_id).await?;
    if conv.kind != ConversationKind::Group {
        return Err(ChatError::Validation(
            "not a group conversation".to_owned(),
        ));
    }
    if !caller.is_admin() && !is_conversation_admin(pool, conversation_id, caller.user_id).await? {
        return Err(ChatError::Permission(
            "group administration requires an admin role".to_owned(),
        ));
    }
    Ok(conv)
}

async fn insert_member(
    pool: &SqlitePool,
    conversation_id: Uuid,
    user_id: Uuid,
    member_role: Role,
) -> AppResult<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO members (conversation_id,user_id,member_role,joined_at_ms) \
         VALUES (?,?,?,?)",
    )
    .bind(conversation_id.to_string())
    .bind(user_id.to_string())
    .bind(member_role.as_str())
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

fn private_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Private conversations are deduplicated per participant pair: the unique
/// `private_key` column makes both racing creators converge on one row.
pub async fn create_private(
    pool: &SqlitePool,
    caller: &Identity,
    peer_id: Uuid,
) -> AppResult<Conversation> {
    if peer_id == caller.user_id {
        return Err(ChatError::Validation(
            "cannot open a private conversation with yourself".to_owned(),
        ));
    }
    // existence check doubles as NotFound for bogus peers
    auth::display_name(pool, peer_id).await?;

    let key = private_key(caller.user_id, peer_id);
    let id = Uuid::now_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT OR IGNORE INTO conversations (id,kind,creator_id,private_key,created_at_ms,updated_at_ms) \
         VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(ConversationKind::Private.as_str())
    .bind(caller.user_id.to_string())
    .bind(&key)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let (existing_id,): (String,) =
        sqlx::query_as("SELECT id FROM conversations WHERE private_key=?")
            .bind(&key)
            .fetch_one(pool)
            .await?;
    let conversation_id = Uuid::parse_str(&existing_id)?;

    insert_member(pool, conversation_id, caller.user_id, Role::Member).await?;
    insert_member(pool, conversation_id, peer_id, Role::Member).await?;

    get(pool, conversation_id).await
}

pub async fn create_group(
    pool: &SqlitePool,
    caller: &Identity,
    name: &str,
    description: Option<&str>,
    participant_ids: &[Uuid],
) -> AppResult<Conversation> {
    if !caller.is_admin() {
        return Err(ChatError::Permission(
            "only admins may create groups".to_owned(),
        ));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::Validation("group name must not be empty".to_owned()));
    }

    let id = Uuid::now_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO conversations (id,kind,name,description,creator_id,created_at_ms,updated_at_ms) \
         VALUES (?,?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(ConversationKind::Group.as_str())
    .bind(name)
    .bind(description)
    .bind(caller.user_id.to_string())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    insert_member(pool, id, caller.user_id, Role::Admin).await?;
    for &participant in participant_ids {
        if participant == caller.user_id {
            continue;
        }
        auth::display_name(pool, participant).await?;
        insert_member(pool, id, participant, Role::Member).await?;
    }

    messages::append_system(
        pool,
        id,
        &format!("{} created the group", caller.display_name),
    )
    .await?;

    get(pool, id).await
}

pub async fn update_group(
    pool: &SqlitePool,
    caller: &Identity,
    conversation_id: Uuid,
    name: Option<&str>,
    description: Option<&str>,
) -> AppResult<Conversation> {
    require_group_admin(pool, conversation_id, caller).await?;
    if matches!(name, Some(n) if n.trim().is_empty()) {
        return Err(ChatError::Validation("group name must not be empty".to_owned()));
    }

    sqlx::query(
        "UPDATE conversations SET name=COALESCE(?,name), description=COALESCE(?,description), \
         updated_at_ms=? WHERE id=?",
    )
    .bind(name.map(str::trim))
    .bind(description)
    .bind(now_ms())
    .bind(conversation_id.to_string())
    .execute(pool)
    .await?;

    get(pool, conversation_id).await
}

/// Adds members and appends one audit system message per user actually added.
/// Returns the refreshed conversation and those messages for fanout. The whole
/// batch is validated up front: an unknown id rejects before any insert.
pub async fn add_members(
    pool: &SqlitePool,
    caller: &Identity,
    conversation_id: Uuid,
    user_ids: &[Uuid],
) -> AppResult<(Conversation, Vec<messages::Message>)> {
    require_group_admin(pool, conversation_id, caller).await?;

    let mut names = Vec::with_capacity(user_ids.len());
    for &user_id in user_ids {
        names.push(auth::display_name(pool, user_id).await?);
    }

    let mut audit = Vec::new();
    for (&user_id, name) in user_ids.iter().zip(&names) {
        if insert_member(pool, conversation_id, user_id, Role::Member).await? {
            let msg = messages::append_system(
                pool,
                conversation_id,
                &format!("{} added {name}", caller.display_name),
            )
            .await?;
            audit.push(msg);
        }
    }

    Ok((get(pool, conversation_id).await?, audit))
}

/// Removes members (never the creator), appending "X was removed" audit
/// messages. Returns the removed ids so the hub can evict their sessions. The
/// whole batch is validated up front: a creator or unknown id anywhere in it
/// rejects before the first delete, so a failure mutates nothing.
pub async fn remove_members(
    pool: &SqlitePool,
    caller: &Identity,
    conversation_id: Uuid,
    user_ids: &[Uuid],
) -> AppResult<(Conversation, Vec<Uuid>, Vec<messages::Message>)> {
    let conv = require_group_admin(pool, conversation_id, caller).await?;

    let mut names = Vec::with_capacity(user_ids.len());
    for &user_id in user_ids {
        if conv.creator_id == Some(user_id) {
            return Err(ChatError::Permission(
                "the group creator cannot be removed".to_owned(),
            ));
        }
        names.push(auth::display_name(pool, user_id).await?);
    }

    let mut removed = Vec::new();
    let mut audit = Vec::new();
    for (&user_id, name) in user_ids.iter().zip(&names) {
        let res = sqlx::query("DELETE FROM members WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(user_id.to_string())
            .execute(pool)
            .await?;
        if res.rows_affected() == 1 {
            removed.push(user_id);
            let msg =
                messages::append_system(pool, conversation_id, &format!("{name} was removed"))
                    .await?;
            audit.push(msg);
        }
    }

    Ok((get(pool, conversation_id).await?, removed, audit))
}

/// Deletes a group and cascades to its messages and reactions.
pub async fn delete_group(
    pool: &SqlitePool,
    caller: &Identity,
    conversation_id: Uuid,
) -> AppResult<()> {
    require_group_admin(pool, conversation_id, caller).await?;

    let conv_id = conversation_id.to_string();
    sqlx::query(
        "DELETE FROM reactions WHERE message_id IN (SELECT id FROM messages WHERE conversation_id=?)",
    )
    .bind(&conv_id)
    .execute(pool)
    .await?;
    sqlx::query("DELETE FROM messages WHERE conversation_id=?")
        .bind(&conv_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM members WHERE conversation_id=?")
        .bind(&conv_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM conversations WHERE id=?")
        .bind(&conv_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn ensure_default_group(pool: &SqlitePool) -> AppResult<Uuid> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM conversations WHERE private_key=?")
            .bind(DEFAULT_GROUP_KEY)
            .fetch_optional(pool)
            .await?;
    if let Some((id,)) = existing {
        return Ok(Uuid::parse_str(&id)?);
    }

    let id = Uuid::now_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT OR IGNORE INTO conversations (id,kind,name,private_key,created_at_ms,updated_at_ms) \
         VALUES (?,?,?,?,?,?)",
    )
    .bind(id.to_string())
    .bind(ConversationKind::Group.as_str())
    .bind(DEFAULT_GROUP_NAME)
    .bind(DEFAULT_GROUP_KEY)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let (id,): (String,) = sqlx::query_as("SELECT id FROM conversations WHERE private_key=?")
        .bind(DEFAULT_GROUP_KEY)
        .fetch_one(pool)
        .await?;
    Ok(Uuid::parse_str(&id)?)
}

/// First channel connect counts as joining the default group. Idempotent;
/// returns the audit message when the user was actually added.
pub async fn join_default_group(
    pool: &SqlitePool,
    identity: &Identity,
) -> AppResult<Option<messages::Message>> {
    let group_id = ensure_default_group(pool).await?;
    if insert_member(pool, group_id, identity.user_id, Role::Member).await? {
        let msg = messages::append_system(
            pool,
            group_id,
            &format!("{} joined {DEFAULT_GROUP_NAME}", identity.display_name),
        )
        .await?;
        return Ok(Some(msg));
    }
    Ok(None)
}
