//! Legacy two-party messaging endpoints.
//!
//! These predate the Conversation entity: threads are addressed by
//! (role, profile id) and stored under the derived pair key, with no
//! conversation row.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{Message, MessagePriority, MessageType, ProfileRef, Role},
    services::{auth::Claims, conversation_key::derive_pair_key},
    AppState,
};

use super::conversations::{page_window, resolve_requester, PaginationQuery};

#[derive(Debug, Deserialize)]
pub struct SendChatRequest {
    pub receiver_id: Uuid,
    pub receiver_role: Role,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: MessagePriority,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendChatRequest>,
) -> AppResult<Json<Message>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let receiver = ProfileRef::new(req.receiver_role, req.receiver_id);
    let message = service
        .send_pair_message(&requester, receiver, req.content, req.message_type, req.priority)
        .await?;

    Ok(Json(message))
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((role, profile_id)): Path<(String, Uuid)>,
    Query(query): Query<PaginationQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;
    let role: Role = role
        .parse()
        .map_err(crate::error::AppError::Validation)?;

    let (limit, offset) = page_window(
        query.limit,
        query.offset,
        state.config.messaging.max_page_size,
    );
    let messages = service
        .pair_history(&requester, ProfileRef::new(role, profile_id), limit, offset)
        .await?;

    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct MarkSeenRequest {
    pub other_id: Uuid,
    pub other_role: Role,
}

#[derive(Debug, Serialize)]
pub struct SeenResponse {
    pub updated: u64,
}

/// Marks the whole pair thread as seen from the requester's side.
pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkSeenRequest>,
) -> AppResult<Json<SeenResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let key = derive_pair_key(
        requester.profile,
        ProfileRef::new(req.other_role, req.other_id),
    );
    let updated = service.mark_conversation_seen(&key, requester.profile).await?;

    Ok(Json(SeenResponse { updated }))
}
