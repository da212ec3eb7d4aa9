use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Error)]
pub enum AppError {
    // Auth errors
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Authentication failed")]
    AuthFailed,

    // Lookup errors
    #[error("Profile not found")]
    ProfileNotFound,
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("Message not found")]
    MessageNotFound,

    // Permission errors
    #[error("Not an active participant of this conversation")]
    NotParticipant,
    #[error("{sender} is not allowed to message {receiver}")]
    MessagingNotAllowed { sender: Role, receiver: Role },
    #[error("Admin access required")]
    AdminOnly,

    // Validation errors
    #[error("A conversation needs at least two participants")]
    InvalidParticipants,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Redis errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // JWT errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    // Internal errors
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Machine-readable reason code, stable across message wording changes.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidToken | AppError::Jwt(_) => "INVALID_TOKEN",
            AppError::TokenExpired => "TOKEN_EXPIRED",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::AuthFailed => "AUTH_FAILED",
            AppError::ProfileNotFound => "PROFILE_NOT_FOUND",
            AppError::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            AppError::MessageNotFound => "MESSAGE_NOT_FOUND",
            AppError::NotParticipant => "NOT_PARTICIPANT",
            AppError::MessagingNotAllowed { .. } => "MESSAGING_NOT_ALLOWED",
            AppError::AdminOnly => "ADMIN_ONLY",
            AppError::InvalidParticipants => "INVALID_PARTICIPANTS",
            AppError::MissingField(_) => "MISSING_FIELD",
            AppError::Validation(_) => "VALIDATION",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Database(_) => "STORAGE_ERROR",
            AppError::Redis(_) => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // 400 Bad Request
            AppError::InvalidParticipants => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::MissingField(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),

            // 401 Unauthorized
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::TokenExpired => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::AuthFailed => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Jwt(_) => (StatusCode::UNAUTHORIZED, "Invalid token".to_string()),

            // 403 Forbidden
            AppError::NotParticipant => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::MessagingNotAllowed { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::AdminOnly => (StatusCode::FORBIDDEN, self.to_string()),

            // 404 Not Found
            AppError::ProfileNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::ConversationNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::MessageNotFound => (StatusCode::NOT_FOUND, self.to_string()),

            // 500 Internal Server Error
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let code = self.code();
        let body = Json(json!({
            "error": message,
            "code": code
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
