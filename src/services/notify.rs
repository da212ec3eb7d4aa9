//! Offline/push notification hand-off.
//!
//! Delivery is owned by an external worker; this side only enqueues. The
//! trait is one-way: callers get no acknowledgment and a failed hand-off
//! never fails the triggering request.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{models::ProfileRef, storage::redis::RedisClient};

#[derive(Debug, Serialize)]
struct QueuedNotification<'a> {
    recipient_id: Uuid,
    recipient_role: &'a str,
    title: &'a str,
    body: &'a str,
    data: serde_json::Value,
    enqueued_at: String,
}

#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    /// Fire-and-forget hand-off of `(recipient, title, body, data)`.
    async fn dispatch(&self, recipient: ProfileRef, title: &str, body: &str, data: serde_json::Value);
}

pub struct RedisNotificationDispatch {
    redis: RedisClient,
}

impl RedisNotificationDispatch {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl NotificationDispatch for RedisNotificationDispatch {
    async fn dispatch(&self, recipient: ProfileRef, title: &str, body: &str, data: serde_json::Value) {
        let queued = QueuedNotification {
            recipient_id: recipient.id(),
            recipient_role: recipient.role().as_str(),
            title,
            body,
            data,
            enqueued_at: Utc::now().to_rfc3339(),
        };

        let payload = match serde_json::to_string(&queued) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to encode notification for {}: {}", recipient.id(), e);
                return;
            }
        };

        if let Err(e) = self.redis.enqueue_notification(&payload).await {
            tracing::warn!(
                "Notification hand-off for {} failed: {}",
                recipient.id(),
                e
            );
        }
    }
}
