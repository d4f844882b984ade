use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, ChatError>;

/// Failure taxonomy shared by the REST surface, the channel protocol and the
/// stores. Channel auth failures close the session; everything else is
/// reported to the caller and mutates nothing.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Auth(_) => "auth",
            ChatError::Permission(_) => "permission",
            ChatError::NotFound(_) => "not_found",
            ChatError::Validation(_) => "validation",
            ChatError::Conflict(_) => "conflict",
            ChatError::Transient(_) => "transient",
            ChatError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
            ChatError::Permission(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "success": false,
                "error": { "code": self.code(), "message": self.to_string() },
            })),
        )
            .into_response()
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".to_owned()),
            other => ChatError::Transient(other.to_string()),
        }
    }
}

impl From<uuid::Error> for ChatError {
    fn from(err: uuid::Error) -> Self {
        ChatError::Validation(format!("malformed identifier: {err}"))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Validation(format!("malformed payload: {err}"))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transient(err.to_string())
    }
}

/// Standard success envelope for the REST surface.
pub fn api_ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}
