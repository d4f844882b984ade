use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use crate::AppResult;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'member',
        status TEXT NOT NULL DEFAULT 'offline',
        last_seen_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS auth_tokens (
        token TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        expires_at_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT,
        description TEXT,
        creator_id TEXT,
        private_key TEXT UNIQUE,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS members (
        conversation_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        member_role TEXT NOT NULL DEFAULT 'member',
        last_read_id TEXT,
        joined_at_ms INTEGER NOT NULL,
        PRIMARY KEY (conversation_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        sender_id TEXT,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        reply_to_id TEXT,
        attachment TEXT,
        edited INTEGER NOT NULL DEFAULT 0,
        edited_at_ms INTEGER,
        deleted INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL,
        UNIQUE (conversation_id, seq)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conv_created
        ON messages (conversation_id, created_at_ms)",
    "CREATE TABLE IF NOT EXISTS reactions (
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        emoji TEXT NOT NULL,
        PRIMARY KEY (message_id, user_id, emoji)
    )",
    "CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        category_id TEXT,
        uploader_id TEXT NOT NULL,
        location TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        author_id TEXT NOT NULL,
        title TEXT NOT NULL,
        body_md TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS comments (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL,
        author_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS fee_records (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        description TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        due_ms INTEGER,
        paid INTEGER NOT NULL DEFAULT 0,
        paid_at_ms INTEGER,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS donations (
        id TEXT PRIMARY KEY,
        donor_id TEXT,
        donor_name TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        note TEXT,
        created_at_ms INTEGER NOT NULL
    )",
];

pub async fn connect(url: &str) -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(url)
        .await?;
    Ok(pool)
}

/// In-memory pool for tests. One connection only: every pooled connection of a
/// `:memory:` database would otherwise see its own empty schema.
pub async fn connect_memory() -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub async fn init(pool: &SqlitePool) -> AppResult<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
