use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{error::AppResult, models::Message, services::auth::Claims, AppState};

use super::conversations::resolve_requester;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub message: String,
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Message>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let message = service.mark_as_read(message_id, requester.profile).await?;

    Ok(Json(message))
}

pub async fn approve_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Message>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let message = service.approve_message(message_id, &requester).await?;

    Ok(Json(message))
}

pub async fn archive_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<Message>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let message = service
        .archive_message(message_id, requester.profile)
        .await?;

    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<StatusResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    service.delete_message(message_id, &requester).await?;

    Ok(Json(StatusResponse {
        message: "Message deleted".to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread: i64,
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<UnreadCountResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let unread = service.unread_count(requester.profile).await?;

    Ok(Json(UnreadCountResponse { unread }))
}
