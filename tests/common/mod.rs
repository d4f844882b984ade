#![allow(dead_code)]

use commonroom::{
    auth::{Identity, Role},
    db,
};
use sqlx::SqlitePool;
use uuid::Uuid;

pub async fn setup() -> SqlitePool {
    let pool = db::connect_memory().await.expect("pool");
    db::init(&pool).await.expect("schema");
    pool
}

pub async fn seed_user(pool: &SqlitePool, name: &str, role: Role) -> Identity {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO users (id,display_name,role) VALUES (?,?,?)")
        .bind(id.to_string())
        .bind(name)
        .bind(role.as_str())
        .execute(pool)
        .await
        .expect("seed user");
    Identity {
        user_id: id,
        display_name: name.to_owned(),
        role,
    }
}

pub async fn seed_token(pool: &SqlitePool, identity: &Identity, token: &str) {
    sqlx::query("INSERT INTO auth_tokens (token,user_id) VALUES (?,?)")
        .bind(token)
        .bind(identity.user_id.to_string())
        .execute(pool)
        .await
        .expect("seed token");
}
