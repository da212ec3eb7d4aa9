use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};

use crate::{
    api::websocket::COMPANY_ROOM,
    error::{AppError, AppResult},
    models::{MessagePriority, Role},
    services::{auth::Claims, events::WsEvent},
    AppState,
};

use super::conversations::resolve_requester;

#[derive(Debug, Serialize)]
pub struct NormalizeKeysResponse {
    pub rewritten: u64,
}

/// Maintenance job: rewrites pair keys stored before the order-independence
/// rule so split threads merge back into one.
pub async fn normalize_keys(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<NormalizeKeysResponse>> {
    let service = state.messaging();
    let requester = resolve_requester(&state, &claims).await?;

    let rewritten = service.normalize_legacy_keys(&requester).await?;

    Ok(Json(NormalizeKeysResponse { rewritten }))
}

#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Target room; defaults to the company-wide room.
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnnouncementResponse {
    pub room: String,
}

/// Pushes an announcement event into a room. Fire-and-forget: an empty room
/// is a success with zero recipients.
pub async fn broadcast_announcement(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AnnouncementRequest>,
) -> AppResult<Json<AnnouncementResponse>> {
    let requester = resolve_requester(&state, &claims).await?;
    if requester.role() != Role::Admin && requester.role() != Role::Hr {
        return Err(AppError::AdminOnly);
    }
    if req.title.trim().is_empty() {
        return Err(AppError::MissingField("title"));
    }

    let room = req.room.unwrap_or_else(|| COMPANY_ROOM.to_string());
    let event = WsEvent::new(
        "announcement",
        &serde_json::json!({
            "title": req.title,
            "body": req.body,
            "priority": req.priority,
            "sender": { "profile_id": requester.id(), "role": requester.role() },
            "created_at": chrono::Utc::now(),
        }),
    );
    state.hub.broadcast_to_room(&room, event).await;

    Ok(Json(AnnouncementResponse { room }))
}
