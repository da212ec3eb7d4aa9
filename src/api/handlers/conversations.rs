use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        ConversationType, ConversationWithDetails, Message, MessagePriority, MessageType,
        ProfileRef, Role,
    },
    services::auth::Claims,
    AppState,
};

use super::super::middleware::auth_identity;

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Clamps a client-supplied page window to sane bounds. Negative or zero
/// values would otherwise reach Postgres and surface as a storage error.
pub(super) fn page_window(limit: i64, offset: i64, max: i64) -> (i64, i64) {
    (limit.clamp(1, max), offset.max(0))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantSpec {
    pub profile_id: Uuid,
    pub role: Role,
}

impl ParticipantSpec {
    fn into_ref(self) -> ProfileRef {
        ProfileRef::new(self.role, self.profile_id)
    }
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PaginationQuery>,
) -> AppResult<Json<Vec<ConversationWithDetails>>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let (limit, offset) = page_window(
        query.limit,
        query.offset,
        state.config.messaging.max_page_size,
    );
    let conversations = service
        .list_conversations(requester.profile, limit, offset)
        .await?;

    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub participants: Vec<ParticipantSpec>,
    #[serde(rename = "type", default = "default_type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub description: Option<String>,
}

fn default_type() -> ConversationType {
    ConversationType::Direct
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> AppResult<Json<ConversationWithDetails>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let participants = req.participants.into_iter().map(|p| p.into_ref()).collect();
    let conversation = service
        .create_conversation(
            &requester,
            participants,
            req.conversation_type,
            req.title,
            req.description,
        )
        .await?;

    Ok(Json(conversation))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<ConversationWithDetails>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let conversation = service
        .get_conversation(conversation_id, requester.profile)
        .await?;

    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_message_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_message_limit() -> i64 {
    50
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<Json<Vec<Message>>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let (limit, offset) = page_window(
        query.limit,
        query.offset,
        state.config.messaging.max_page_size,
    );
    let messages = service
        .list_conversation_messages(conversation_id, requester.profile, limit, offset)
        .await?;

    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: MessagePriority,
    pub reply_to: Option<Uuid>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<Message>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let message = service
        .send_message(
            conversation_id,
            &requester,
            req.content,
            req.message_type,
            req.priority,
            req.reply_to,
        )
        .await?;

    Ok(Json(message))
}

pub async fn add_participant(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<ParticipantSpec>,
) -> AppResult<Json<ConversationWithDetails>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let conversation = service
        .add_participant(conversation_id, requester.profile, req.into_ref())
        .await?;

    Ok(Json(conversation))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((conversation_id, profile_id, role)): Path<(Uuid, Uuid, String)>,
) -> AppResult<Json<StatusResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;
    let role: Role = role
        .parse()
        .map_err(crate::error::AppError::Validation)?;

    service
        .remove_participant(conversation_id, &requester, ProfileRef::new(role, profile_id))
        .await?;

    Ok(Json(StatusResponse {
        message: "Participant removed".to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct SeenResponse {
    pub updated: u64,
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> AppResult<Json<SeenResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let updated = service
        .mark_conversation_seen(&conversation_id.to_string(), requester.profile)
        .await?;

    Ok(Json(SeenResponse { updated }))
}

pub(super) async fn resolve_requester(
    state: &AppState,
    claims: &Claims,
) -> AppResult<crate::models::ResolvedProfile> {
    let (auth_id, role) = auth_identity(claims)?;
    state.messaging().identity().resolve(auth_id, role).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_window_clamps_hostile_values() {
        assert_eq!(page_window(50, 0, 200), (50, 0));
        assert_eq!(page_window(5000, 10, 200), (200, 10));
        assert_eq!(page_window(-3, -7, 200), (1, 0));
        assert_eq!(page_window(0, 0, 200), (1, 0));
    }
}
