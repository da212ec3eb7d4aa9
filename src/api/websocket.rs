//! Presence & room engine.
//!
//! Tracks which profile sits behind which live socket, manages room
//! membership (personal, role, department, company-wide) and exposes the
//! broadcast primitives. All maps are owned exclusively by [`PresenceHub`];
//! handlers never touch them directly. State is process-local and rebuilt
//! empty on restart; the Redis publish inside [`PresenceHub::broadcast_to_user`]
//! is what reaches sockets held by other instances.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{
    models::{ProfileRef, ResolvedProfile, Role},
    services::{
        auth::AuthService,
        events::{PresenceChange, WsEvent},
        identity::IdentityService,
    },
    AppState,
};

pub const COMPANY_ROOM: &str = "company_wide";

type ConnId = Uuid;

/// Envelope for frames relayed over the Redis channel to sockets held by
/// other instances. The subscriber drops frames tagged with its own instance,
/// so a locally-connected recipient is delivered once, not twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub instance: Uuid,
    pub event: WsEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsIncomingMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-connection lifecycle. A reconnect is a brand-new `Connecting`
/// instance; nothing is carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Authenticating,
    Authenticated,
    Disconnected,
}

/// In-memory connection/room registry. Pure bookkeeping, no I/O, so it can
/// be exercised directly in tests.
#[derive(Default)]
struct Registry {
    clients: HashMap<ConnId, mpsc::Sender<WsEvent>>,
    profile_sockets: HashMap<ProfileRef, ConnId>,
    conn_profiles: HashMap<ConnId, ProfileRef>,
    rooms: HashMap<String, HashSet<ConnId>>,
    conn_rooms: HashMap<ConnId, HashSet<String>>,
}

impl Registry {
    fn register(&mut self, conn: ConnId, sender: mpsc::Sender<WsEvent>) {
        self.clients.insert(conn, sender);
    }

    /// Binds an authenticated connection to its profile. Replaces any stale
    /// mapping left by an earlier socket for the same profile.
    fn bind(&mut self, conn: ConnId, profile: ProfileRef) {
        self.profile_sockets.insert(profile, conn);
        self.conn_profiles.insert(conn, profile);
    }

    fn join_room(&mut self, conn: ConnId, room: &str) {
        self.rooms.entry(room.to_string()).or_default().insert(conn);
        self.conn_rooms
            .entry(conn)
            .or_default()
            .insert(room.to_string());
    }

    /// Removes a connection from every structure. Returns the profile it was
    /// bound to, if it ever authenticated.
    fn remove(&mut self, conn: ConnId) -> Option<ProfileRef> {
        self.clients.remove(&conn);
        if let Some(rooms) = self.conn_rooms.remove(&conn) {
            for room in rooms {
                if let Some(members) = self.rooms.get_mut(&room) {
                    members.remove(&conn);
                    if members.is_empty() {
                        self.rooms.remove(&room);
                    }
                }
            }
        }
        let profile = self.conn_profiles.remove(&conn)?;
        // Only unmap the profile if this socket is still its current one; a
        // newer socket may have replaced it.
        if self.profile_sockets.get(&profile) == Some(&conn) {
            self.profile_sockets.remove(&profile);
        }
        Some(profile)
    }

    fn sender_for_profile(&self, profile: ProfileRef) -> Option<mpsc::Sender<WsEvent>> {
        let conn = self.profile_sockets.get(&profile)?;
        self.clients.get(conn).cloned()
    }

    fn senders_for_room(&self, room: &str) -> Vec<mpsc::Sender<WsEvent>> {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|conn| self.clients.get(conn).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn all_senders(&self) -> Vec<mpsc::Sender<WsEvent>> {
        self.clients.values().cloned().collect()
    }
}

pub struct PresenceHub {
    /// Tags frames this process publishes on the shared pub/sub channel.
    instance: Uuid,
    registry: RwLock<Registry>,
    /// Cross-instance fan-out channel. Absent only in tests.
    redis: Option<crate::storage::redis::RedisClient>,
}

impl PresenceHub {
    pub fn new(redis: crate::storage::redis::RedisClient) -> Self {
        Self {
            instance: Uuid::new_v4(),
            registry: RwLock::new(Registry::default()),
            redis: Some(redis),
        }
    }

    /// Whether a relayed frame originates from another instance. Own
    /// publishes loop back on the same channel and must not be re-delivered.
    pub fn accepts_relay(&self, frame: &RelayFrame) -> bool {
        frame.instance != self.instance
    }

    pub async fn register(&self, conn: ConnId, sender: mpsc::Sender<WsEvent>) {
        self.registry.write().await.register(conn, sender);
        tracing::debug!("Connection registered: {}", conn);
    }

    /// Applies the room joins and mappings for a freshly authenticated
    /// connection. Idempotent; re-authentication replaces the mapping.
    pub async fn attach(&self, conn: ConnId, identity: &ResolvedProfile) {
        let profile = identity.profile;
        let mut registry = self.registry.write().await;
        registry.bind(conn, profile);
        registry.join_room(conn, &profile.personal_room());
        registry.join_room(conn, profile.role().room_name());
        registry.join_room(conn, COMPANY_ROOM);
        if profile.role() == Role::Employee {
            if let Some(department) = &identity.department {
                registry.join_room(conn, &format!("dept_{}", department));
            }
        }
        tracing::info!("{} {} attached on {}", profile.role(), profile.id(), conn);
    }

    /// Tears down a connection and reports which profile disconnected.
    pub async fn detach(&self, conn: ConnId) -> Option<ProfileRef> {
        let profile = self.registry.write().await.remove(conn);
        if let Some(profile) = profile {
            tracing::info!("{} {} detached from {}", profile.role(), profile.id(), conn);
        }
        profile
    }

    /// Best-effort delivery to one profile: the tracked socket first, then
    /// the personal room (covers stale mappings), then the Redis channel for
    /// sockets on other instances. Never fails.
    pub async fn broadcast_to_user(&self, profile: ProfileRef, event: WsEvent) {
        {
            let registry = self.registry.read().await;
            match registry.sender_for_profile(profile) {
                Some(sender) => {
                    if sender.send(event.clone()).await.is_err() {
                        tracing::debug!(
                            "Direct delivery to {} failed, falling back to room",
                            profile.id()
                        );
                        for sender in registry.senders_for_room(&profile.personal_room()) {
                            let _ = sender.send(event.clone()).await;
                        }
                    }
                }
                None => {
                    for sender in registry.senders_for_room(&profile.personal_room()) {
                        let _ = sender.send(event.clone()).await;
                    }
                }
            }
        }

        if let Some(redis) = &self.redis {
            let frame = RelayFrame {
                instance: self.instance,
                event,
            };
            if let Ok(payload) = serde_json::to_string(&frame) {
                if let Err(e) = redis.publish_event(&profile.id().to_string(), &payload).await {
                    tracing::debug!("Redis fan-out for {} failed: {}", profile.id(), e);
                }
            }
        }
    }

    pub async fn broadcast_to_room(&self, room: &str, event: WsEvent) {
        let senders = self.registry.read().await.senders_for_room(room);
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub async fn broadcast_to_all(&self, event: WsEvent) {
        let senders = self.registry.read().await.all_senders();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }
}

/// WebSocket upgrade. Unauthenticated at this point: the first frame must be
/// an `authenticate` message carrying the credential token.
pub async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsEvent>(256);

    let mut conn_state = ConnectionState::Connecting;
    tracing::trace!("conn {} -> {:?}", conn_id, conn_state);
    state.hub.register(conn_id, tx.clone()).await;

    // Authentication phase. Events broadcast while this races are
    // best-effort by contract; the connection is in no room yet.
    conn_state = ConnectionState::Authenticating;
    tracing::trace!("conn {} -> {:?}", conn_id, conn_state);
    let identity = match tokio::time::timeout(
        state.config.messaging.ws_auth_deadline,
        await_authentication(&state, &mut ws_receiver),
    )
    .await
    {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            tracing::debug!("Connection {} failed authentication", conn_id);
            let _ = ws_sender
                .send(close_frame("authentication failed"))
                .await;
            state.hub.detach(conn_id).await;
            return;
        }
        Err(_) => {
            tracing::debug!("Connection {} hit the auth deadline", conn_id);
            let _ = ws_sender.send(close_frame("authentication timeout")).await;
            state.hub.detach(conn_id).await;
            return;
        }
    };

    state.hub.attach(conn_id, &identity).await;
    conn_state = ConnectionState::Authenticated;
    tracing::trace!("conn {} -> {:?}", conn_id, conn_state);

    let ack = WsEvent::new("authenticated", &identity);
    let _ = tx.send(ack).await;

    state
        .hub
        .broadcast_to_all(PresenceChange::connected(identity.profile))
        .await;

    let _ = state
        .redis
        .set_presence(
            &identity.id().to_string(),
            "online",
            state.config.messaging.presence_ttl,
        )
        .await;

    // Frames published by other instances for this profile. Own publishes
    // loop back on the channel and are dropped by the instance tag.
    let redis_client = state.redis.clone();
    let profile_id = identity.id().to_string();
    let tx_clone = tx.clone();
    let relay_hub = state.hub.clone();
    let redis_task = tokio::spawn(async move {
        if let Ok(mut pubsub) = redis_client.subscribe_events(&profile_id).await {
            while let Some(msg) = pubsub.on_message().next().await {
                if let Ok(payload) = msg.get_payload::<String>() {
                    if let Ok(frame) = serde_json::from_str::<RelayFrame>(&payload) {
                        if relay_hub.accepts_relay(&frame) {
                            let _ = tx_clone.send(frame.event).await;
                        }
                    }
                }
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let hub = state.hub.clone();
    let redis = state.redis.clone();
    let identity_for_recv = identity.clone();
    let presence_ttl = state.config.messaging.presence_ttl;
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if let Ok(msg) = serde_json::from_str::<WsIncomingMessage>(&text) {
                        handle_incoming_message(&hub, &redis, &identity_for_recv, presence_ttl, msg)
                            .await;
                    }
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by axum
                }
                Ok(Message::Close(_)) => break,
                Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
        _ = redis_task => {},
    }

    conn_state = ConnectionState::Disconnected;
    tracing::trace!("conn {} -> {:?}", conn_id, conn_state);

    if state.hub.detach(conn_id).await.is_some() {
        state
            .hub
            .broadcast_to_all(PresenceChange::disconnected(identity.profile))
            .await;
    }
    let _ = state.redis.clear_presence(&identity.id().to_string()).await;
}

/// Reads frames until a valid `authenticate` arrives. Any other frame, a bad
/// token, or a closed socket aborts with `None`; nothing is recorded for a
/// failed authentication.
async fn await_authentication(
    state: &AppState,
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Option<ResolvedProfile> {
    let auth = AuthService::new(state.config.jwt.clone());
    let identity_service = IdentityService::new(state.db.clone());

    while let Some(result) = ws_receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        };

        let msg: WsIncomingMessage = serde_json::from_str(&text).ok()?;
        if msg.msg_type != "authenticate" {
            return None;
        }
        let token = msg.payload.get("token")?.as_str()?;
        let claims = auth.validate_token(token).ok()?;
        let auth_id = Uuid::parse_str(&claims.sub).ok()?;
        let claimed_role = Role::from_str(&claims.role).ok()?;

        return identity_service.resolve(auth_id, claimed_role).await.ok();
    }
    None
}

async fn handle_incoming_message(
    hub: &Arc<PresenceHub>,
    redis: &crate::storage::redis::RedisClient,
    identity: &ResolvedProfile,
    presence_ttl: std::time::Duration,
    msg: WsIncomingMessage,
) {
    match msg.msg_type.as_str() {
        "ping" => {
            hub.broadcast_to_user(identity.profile, WsEvent::new("pong", &serde_json::json!({})))
                .await;
        }
        "typing" => {
            // Forwarded straight to the receiver's personal room; no
            // persistence for typing indicators.
            let receiver = msg
                .payload
                .get("receiver_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            let role = msg
                .payload
                .get("receiver_role")
                .and_then(|v| v.as_str())
                .and_then(|s| Role::from_str(s).ok());
            if let (Some(receiver), Some(role)) = (receiver, role) {
                let event = WsEvent::new(
                    "typing",
                    &serde_json::json!({
                        "profile_id": identity.id(),
                        "role": identity.role(),
                        "is_typing": msg.payload.get("is_typing").and_then(|v| v.as_bool()).unwrap_or(true),
                    }),
                );
                hub.broadcast_to_user(ProfileRef::new(role, receiver), event)
                    .await;
            }
        }
        "presence" => {
            if let Some(status) = msg.payload.get("status").and_then(|s| s.as_str()) {
                let _ = redis
                    .set_presence(&identity.id().to_string(), status, presence_ttl)
                    .await;
            }
        }
        other => {
            tracing::warn!("Unknown message type: {}", other);
        }
    }
}

fn close_frame(reason: &str) -> Message {
    Message::Close(Some(axum::extract::ws::CloseFrame {
        code: axum::extract::ws::close_code::POLICY,
        reason: reason.to_string().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee(id: Uuid) -> ResolvedProfile {
        ResolvedProfile {
            profile: ProfileRef::Employee(id),
            name: "Test Employee".to_string(),
            email: "test@example.com".to_string(),
            department: Some("Engineering".to_string()),
        }
    }

    #[test]
    fn registry_remove_clears_rooms_and_mapping() {
        let mut registry = Registry::default();
        let conn = Uuid::new_v4();
        let profile = ProfileRef::Hr(Uuid::new_v4());
        let (tx, _rx) = mpsc::channel(4);

        registry.register(conn, tx);
        registry.bind(conn, profile);
        registry.join_room(conn, "hr_room");
        registry.join_room(conn, COMPANY_ROOM);

        assert!(registry.sender_for_profile(profile).is_some());
        assert_eq!(registry.senders_for_room("hr_room").len(), 1);

        assert_eq!(registry.remove(conn), Some(profile));
        assert!(registry.sender_for_profile(profile).is_none());
        assert!(registry.senders_for_room("hr_room").is_empty());
        assert!(registry.senders_for_room(COMPANY_ROOM).is_empty());
    }

    #[test]
    fn reauthentication_replaces_stale_mapping() {
        let mut registry = Registry::default();
        let profile = ProfileRef::Employee(Uuid::new_v4());
        let old_conn = Uuid::new_v4();
        let new_conn = Uuid::new_v4();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);

        registry.register(old_conn, old_tx);
        registry.bind(old_conn, profile);
        registry.register(new_conn, new_tx);
        registry.bind(new_conn, profile);

        // Removing the superseded socket must not unmap the new one.
        registry.remove(old_conn);
        assert!(registry.sender_for_profile(profile).is_some());
    }

    #[tokio::test]
    async fn broadcast_to_empty_room_is_a_no_op() {
        let hub = hub_without_redis().await;
        // No recipients connected; the call must simply return.
        hub.broadcast_to_room(COMPANY_ROOM, WsEvent::new("x", &serde_json::json!({})))
            .await;
        assert_eq!(hub.connected_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_to_user_falls_back_to_personal_room() {
        let hub = hub_without_redis().await;
        let identity = employee(Uuid::new_v4());
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);

        hub.register(conn, tx).await;
        hub.attach(conn, &identity).await;

        // Drop the direct mapping but keep the room membership, simulating a
        // stale profile -> socket entry.
        hub.registry
            .write()
            .await
            .profile_sockets
            .remove(&identity.profile);

        hub.broadcast_to_user(identity.profile, WsEvent::new("hello", &serde_json::json!({})))
            .await;

        let event = rx.recv().await.expect("room fallback delivered the event");
        assert_eq!(event.event_type, "hello");
    }

    #[tokio::test]
    async fn attach_joins_role_department_and_company_rooms() {
        let hub = hub_without_redis().await;
        let identity = employee(Uuid::new_v4());
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);

        hub.register(conn, tx).await;
        hub.attach(conn, &identity).await;

        let registry = hub.registry.read().await;
        assert_eq!(registry.senders_for_room("employee_room").len(), 1);
        assert_eq!(registry.senders_for_room(COMPANY_ROOM).len(), 1);
        assert_eq!(registry.senders_for_room("dept_Engineering").len(), 1);
        assert_eq!(
            registry
                .senders_for_room(&identity.profile.personal_room())
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn relay_frames_from_this_instance_are_dropped() {
        let hub = hub_without_redis().await;
        let other = hub_without_redis().await;
        let event = WsEvent::new("hello", &serde_json::json!({}));

        let own = RelayFrame {
            instance: hub.instance,
            event: event.clone(),
        };
        let foreign = RelayFrame {
            instance: other.instance,
            event,
        };

        assert!(!hub.accepts_relay(&own));
        assert!(hub.accepts_relay(&foreign));

        // The tag survives the wire format.
        let decoded: RelayFrame =
            serde_json::from_str(&serde_json::to_string(&own).unwrap()).unwrap();
        assert!(!hub.accepts_relay(&decoded));
    }

    async fn hub_without_redis() -> PresenceHub {
        PresenceHub {
            instance: Uuid::new_v4(),
            registry: RwLock::new(Registry::default()),
            redis: None,
        }
    }
}
