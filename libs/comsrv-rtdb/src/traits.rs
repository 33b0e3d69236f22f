//! Trait definitions for the realtime store abstraction

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message delivered to a pub/sub subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Raw payload
    pub payload: String,
}

/// Unified realtime-store interface.
///
/// Implementations:
/// - `RedisRtdb`: production Redis backend
/// - `MemoryRtdb`: in-memory backend for tests
#[async_trait]
pub trait Rtdb: Send + Sync + 'static {
    // ========== Key-value operations ==========

    /// Get value by key
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set value for key
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Set many keys in one round trip (pipelined)
    async fn mset(&self, pairs: &[(String, Bytes)]) -> Result<()>;

    /// Delete key; returns whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    // ========== Hash operations ==========

    /// Set a single hash field
    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()>;

    /// Set multiple hash fields in one round trip
    async fn hash_mset(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()>;

    /// Get a single hash field
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>>;

    /// Get all fields of a hash
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>>;

    /// Delete a hash field; returns whether it existed
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool>;

    // ========== Messaging ==========

    /// Publish a message to a channel; returns receiver count
    /// (the in-memory backend reports local subscribers only).
    async fn publish(&self, channel: &str, message: &str) -> Result<u32>;

    /// Subscribe to a set of channels.
    ///
    /// Messages arrive on the returned receiver until the subscription is
    /// dropped or the backend connection is lost.
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>>;
}
