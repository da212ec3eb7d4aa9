use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use super::{handlers, middleware::auth_middleware, websocket::handle_websocket};
use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    // Conversation routes (protected)
    let conversation_routes = Router::new()
        .route("/", get(handlers::conversations::get_conversations))
        .route("/", post(handlers::conversations::create_conversation))
        .route("/:id", get(handlers::conversations::get_conversation))
        .route("/:id/messages", get(handlers::conversations::get_messages))
        .route("/:id/messages", post(handlers::conversations::send_message))
        .route("/:id/participants", post(handlers::conversations::add_participant))
        .route(
            "/:id/participants/:profile_id/:role",
            delete(handlers::conversations::remove_participant),
        )
        .route("/:id/seen", post(handlers::conversations::mark_seen))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Message routes (protected)
    let message_routes = Router::new()
        .route("/unread-count", get(handlers::messages::unread_count))
        .route("/:id/read", post(handlers::messages::mark_read))
        .route("/:id/approve", post(handlers::messages::approve_message))
        .route("/:id/archive", post(handlers::messages::archive_message))
        .route("/:id", delete(handlers::messages::delete_message))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Legacy pair-keyed chat routes (protected)
    let chat_routes = Router::new()
        .route("/send", post(handlers::chat::send_message))
        .route("/history/:role/:profile_id", get(handlers::chat::get_history))
        .route("/seen", post(handlers::chat::mark_seen))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Admin maintenance routes (protected; role check in the service layer)
    let admin_routes = Router::new()
        .route("/maintenance/normalize-keys", post(handlers::admin::normalize_keys))
        .route("/announcements", post(handlers::admin::broadcast_announcement))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // WebSocket route: public at upgrade time, authenticated by the first
    // frame inside the presence engine.
    let ws_route = Router::new().route("/ws", get(handle_websocket));

    Router::new()
        .nest("/conversations", conversation_routes)
        .nest("/messages", message_routes)
        .nest("/chat", chat_routes)
        .nest("/admin", admin_routes)
        .merge(ws_route)
        .with_state(state)
}
