//! In-memory implementation of the realtime store
//!
//! Backs tests and development runs without a Redis instance. Publish
//! history is recorded so tests can assert on notification ordering.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::traits::{PubSubMessage, Rtdb};

#[derive(Default)]
pub struct MemoryRtdb {
    strings: DashMap<String, Bytes>,
    hashes: DashMap<String, DashMap<String, Bytes>>,
    subscribers: DashMap<String, Vec<mpsc::Sender<PubSubMessage>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryRtdb {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(channel, payload)` pairs published so far, in publish order.
    pub fn published_messages(&self) -> Vec<(String, String)> {
        self.published.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Convenience accessor for tests: string value under `key`, UTF-8 decoded.
    pub fn string_value(&self, key: &str) -> Option<String> {
        self.strings
            .get(key)
            .map(|v| String::from_utf8_lossy(v.as_ref()).into_owned())
    }

    fn deliver(&self, channel: &str, message: &str) -> u32 {
        let mut delivered = 0u32;
        if let Some(mut senders) = self.subscribers.get_mut(channel) {
            senders.retain(|tx| {
                let ok = tx
                    .try_send(PubSubMessage {
                        channel: channel.to_string(),
                        payload: message.to_string(),
                    })
                    .is_ok();
                if ok {
                    delivered += 1;
                }
                ok
            });
        }
        delivered
    }
}

#[async_trait]
impl Rtdb for MemoryRtdb {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.strings.insert(key.to_string(), value);
        Ok(())
    }

    async fn mset(&self, pairs: &[(String, Bytes)]) -> Result<()> {
        for (key, value) in pairs {
            self.strings.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let s = self.strings.remove(key).is_some();
        let h = self.hashes.remove(key).is_some();
        Ok(s || h)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.strings.contains_key(key) || self.hashes.contains_key(key))
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_mset(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<()> {
        let entry = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field, value);
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).map(|v| v.clone())))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| {
                h.iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        if let Ok(mut log) = self.published.lock() {
            log.push((channel.to_string(), message.to_string()));
        }
        Ok(self.deliver(channel, message))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(256);
        for channel in channels {
            self.subscribers
                .entry(channel.clone())
                .or_default()
                .push(tx.clone());
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip() {
        let db = MemoryRtdb::new();
        db.set("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(db.del("a").await.unwrap());
        assert_eq!(db.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mset_writes_all_keys() {
        let db = MemoryRtdb::new();
        db.mset(&[
            ("x".to_string(), Bytes::from_static(b"1")),
            ("y".to_string(), Bytes::from_static(b"2")),
        ])
        .await
        .unwrap();
        assert_eq!(db.string_value("x").as_deref(), Some("1"));
        assert_eq!(db.string_value("y").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn hash_roundtrip() {
        let db = MemoryRtdb::new();
        db.hash_mset(
            "h",
            vec![
                ("f1".to_string(), Bytes::from_static(b"a")),
                ("f2".to_string(), Bytes::from_static(b"b")),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            db.hash_get("h", "f1").await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
        let all = db.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(db.hash_del("h", "f1").await.unwrap());
        assert!(!db.hash_del("h", "f1").await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_and_log() {
        let db = MemoryRtdb::new();
        let mut rx = db.subscribe(&["news".to_string()]).await.unwrap();
        let delivered = db.publish("news", "hello").await.unwrap();
        assert_eq!(delivered, 1);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "news");
        assert_eq!(msg.payload, "hello");

        assert_eq!(
            db.published_messages(),
            vec![("news".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn publish_without_subscriber_counts_zero() {
        let db = MemoryRtdb::new();
        assert_eq!(db.publish("nobody", "x").await.unwrap(), 0);
    }
}
