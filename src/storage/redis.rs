use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::time::Duration;

use crate::error::AppResult;

const NOTIFICATION_QUEUE: &str = "notifications:queue";

#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    // Presence
    pub async fn set_presence(
        &self,
        profile_id: &str,
        status: &str,
        ttl: Duration,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = format!("presence:{}", profile_id);
        let _: () = conn.set_ex(&key, status, ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn get_presence(&self, profile_id: &str) -> AppResult<String> {
        let mut conn = self.conn.clone();
        let key = format!("presence:{}", profile_id);
        let value: Option<String> = conn.get(&key).await?;
        Ok(value.unwrap_or_else(|| "offline".to_string()))
    }

    pub async fn clear_presence(&self, profile_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = format!("presence:{}", profile_id);
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    // Pub/Sub fan-out for other server instances
    pub async fn publish_event(&self, profile_id: &str, event: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let channel = format!("events:{}", profile_id);
        let _: () = conn.publish(&channel, event).await?;
        Ok(())
    }

    pub async fn subscribe_events(&self, profile_id: &str) -> AppResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = format!("events:{}", profile_id);
        pubsub.subscribe(&channel).await?;
        Ok(pubsub)
    }

    // Offline notification hand-off queue
    pub async fn enqueue_notification(&self, payload: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(NOTIFICATION_QUEUE, payload).await?;
        Ok(())
    }
}
