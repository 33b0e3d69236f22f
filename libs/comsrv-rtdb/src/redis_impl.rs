//! Redis implementation of the realtime store

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::{PubSubMessage, Rtdb};

/// Buffer depth for subscription receivers.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Redis-backed realtime store.
///
/// Uses a `ConnectionManager` which transparently re-establishes the
/// connection after a drop; subscriptions run on dedicated pub/sub
/// connections with their own retry loop.
pub struct RedisRtdb {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisRtdb {
    /// Connect to Redis at the given URL.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| crate::RtdbError::Connection(format!("invalid redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Rtdb for RedisRtdb {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value.as_ref()).await?;
        Ok(())
    }

    async fn mset(&self, pairs: &[(String, Bytes)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, value) in pairs {
            pipe.set(key, value.as_ref()).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u32 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value.as_ref()).await?;
        Ok(())
    }

    async fn hash_mset(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let args: Vec<(&str, &[u8])> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_ref()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &args).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.hget(key, field).await?;
        Ok(value.map(Bytes::from))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        let mut conn = self.conn.clone();
        let data: HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(data.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u32 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        Ok(conn.publish(channel, message).await?)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let channels = channels.to_vec();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(ps) => ps,
                    Err(e) => {
                        warn!("pubsub connect failed: {e}, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    },
                };
                if let Err(e) = pubsub.subscribe(&channels).await {
                    warn!("pubsub subscribe failed: {e}, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                debug!("subscribed to {} channels", channels.len());

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("dropping non-utf8 pubsub payload on {channel}: {e}");
                            continue;
                        },
                    };
                    if tx.send(PubSubMessage { channel, payload }).await.is_err() {
                        // Receiver dropped; end the subscription task.
                        return;
                    }
                }
                if tx.is_closed() {
                    return;
                }
                warn!("pubsub connection lost, resubscribing");
            }
        });

        Ok(rx)
    }
}
