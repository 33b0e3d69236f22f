//! Publication layer
//!
//! Surfaces decoded samples to downstream services: value keys under
//! `{channel_id}:{kind_tag}:{point_id}`, optional per-kind hashes, a
//! quality hash for non-GOOD points, channel status records, and a pub/sub
//! notification after every successful value write. Writes are batched
//! (size or age, whichever first) and flushed as pipelined transactions;
//! per-channel FIFO order is preserved by the single flusher task.

use bytes::Bytes;
use comsrv_rtdb::Rtdb;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{ComSrvError, Result};
use crate::points::{Quality, Sample};

/// Publisher tuning knobs.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Flush when this many samples are pending
    pub batch_size: usize,
    /// Flush when the oldest pending sample reaches this age
    pub max_wait: Duration,
    /// Mirror values into `{prefix}:{channel_id}:{kind_tag}` hashes
    pub hash_layout: bool,
    /// Prefix for reserved keys (status, quality, command status)
    pub key_prefix: String,
    /// Submission queue depth
    pub queue_depth: usize,
    /// Flush attempts before a batch is dropped
    pub flush_retries: u32,
    /// Initial delay between flush attempts
    pub retry_initial: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_wait: Duration::from_millis(20),
            hash_layout: false,
            key_prefix: "comsrv".to_string(),
            queue_depth: 1024,
            flush_retries: 5,
            retry_initial: Duration::from_millis(50),
        }
    }
}

/// Publisher health counters; flush failures are never silent.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub samples_in: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub flush_retries: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub notify_failures: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PublisherStatsSnapshot {
    pub samples_in: u64,
    pub batches_flushed: u64,
    pub flush_retries: u64,
    pub dropped_batches: u64,
    pub notify_failures: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
        }
    }
}

enum PubItem {
    Sample(Sample),
    Status(u16, String),
    CommandStatus(String, String),
    Flush(oneshot::Sender<()>),
}

/// Shared handle through which all channels publish. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PubItem>,
    stats: Arc<PublisherStats>,
    key_prefix: String,
}

/// Background flusher task, held by the supervisor for shutdown.
pub struct PublisherTask {
    handle: JoinHandle<()>,
}

impl PublisherTask {
    /// Wait for the flusher to exit. Call after dropping the last
    /// `Publisher` clone (typically after a final `flush`).
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("publisher task join failed: {e}");
        }
    }
}

impl Publisher {
    /// Start the flusher task over the given store backend.
    pub fn spawn(rtdb: Arc<dyn Rtdb>, config: PublisherConfig) -> (Self, PublisherTask) {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let stats = Arc::new(PublisherStats::default());
        let key_prefix = config.key_prefix.clone();
        let flusher = Flusher {
            rtdb,
            config,
            stats: stats.clone(),
            last_quality: HashMap::new(),
        };
        let handle = tokio::spawn(flusher.run(rx));
        (
            Self {
                tx,
                stats,
                key_prefix,
            },
            PublisherTask { handle },
        )
    }

    /// Queue a sample. Suspends only while the submission queue is full.
    pub async fn write(&self, sample: Sample) -> Result<()> {
        self.stats.samples_in.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(PubItem::Sample(sample))
            .await
            .map_err(|_| ComSrvError::Storage("publisher stopped".to_string()))
    }

    /// Queue a channel status record for the reserved status key.
    pub async fn write_status(&self, channel_id: u16, record: String) -> Result<()> {
        self.tx
            .send(PubItem::Status(channel_id, record))
            .await
            .map_err(|_| ComSrvError::Storage("publisher stopped".to_string()))
    }

    /// Queue a terminal command status record.
    pub async fn write_command_status(&self, command_id: &str, record: String) -> Result<()> {
        self.tx
            .send(PubItem::CommandStatus(command_id.to_string(), record))
            .await
            .map_err(|_| ComSrvError::Storage("publisher stopped".to_string()))
    }

    /// Flush everything queued so far and wait for the store writes.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(PubItem::Flush(ack))
            .await
            .map_err(|_| ComSrvError::Storage("publisher stopped".to_string()))?;
        done.await
            .map_err(|_| ComSrvError::Storage("publisher stopped".to_string()))
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

struct Flusher {
    rtdb: Arc<dyn Rtdb>,
    config: PublisherConfig,
    stats: Arc<PublisherStats>,
    /// Last published quality per point, for clearing quality marks
    last_quality: HashMap<(u16, u32), Quality>,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::Receiver<PubItem>) {
        let mut samples: Vec<Sample> = Vec::with_capacity(self.config.batch_size);
        let mut statuses: Vec<(u16, String)> = Vec::new();
        let mut command_statuses: Vec<(String, String)> = Vec::new();
        let mut flush_at = Instant::now();

        loop {
            let idle = samples.is_empty() && statuses.is_empty() && command_statuses.is_empty();
            let item = if idle {
                rx.recv().await
            } else {
                tokio::select! {
                    item = rx.recv() => item,
                    () = tokio::time::sleep_until(flush_at) => {
                        self.flush(&mut samples, &mut statuses, &mut command_statuses).await;
                        continue;
                    },
                }
            };

            match item {
                Some(PubItem::Sample(sample)) => {
                    if idle {
                        flush_at = Instant::now() + self.config.max_wait;
                    }
                    samples.push(sample);
                    if samples.len() >= self.config.batch_size {
                        self.flush(&mut samples, &mut statuses, &mut command_statuses).await;
                    }
                },
                Some(PubItem::Status(channel_id, record)) => {
                    if idle {
                        flush_at = Instant::now() + self.config.max_wait;
                    }
                    statuses.push((channel_id, record));
                },
                Some(PubItem::CommandStatus(command_id, record)) => {
                    if idle {
                        flush_at = Instant::now() + self.config.max_wait;
                    }
                    command_statuses.push((command_id, record));
                },
                Some(PubItem::Flush(ack)) => {
                    self.flush(&mut samples, &mut statuses, &mut command_statuses).await;
                    let _ = ack.send(());
                },
                None => {
                    self.flush(&mut samples, &mut statuses, &mut command_statuses).await;
                    break;
                },
            }
        }
        debug!("publisher flusher stopped");
    }

    async fn flush(
        &mut self,
        samples: &mut Vec<Sample>,
        statuses: &mut Vec<(u16, String)>,
        command_statuses: &mut Vec<(String, String)>,
    ) {
        if samples.is_empty() && statuses.is_empty() && command_statuses.is_empty() {
            return;
        }
        let batch: Vec<Sample> = samples.drain(..).collect();
        let statuses: Vec<(u16, String)> = statuses.drain(..).collect();
        let command_statuses: Vec<(String, String)> = command_statuses.drain(..).collect();

        // Store writes, assembled in sample order.
        let mut pairs: Vec<(String, Bytes)> = Vec::with_capacity(batch.len());
        let mut hash_updates: HashMap<String, Vec<(String, Bytes)>> = HashMap::new();
        let mut quality_sets: HashMap<u16, Vec<(String, Bytes)>> = HashMap::new();
        let mut quality_clears: Vec<(u16, u32)> = Vec::new();
        let mut notifications: Vec<(String, String)> = Vec::with_capacity(batch.len());

        for sample in &batch {
            let point_key = format!(
                "{}:{}:{}",
                sample.channel_id,
                sample.kind.tag(),
                sample.point_id
            );
            if sample.quality.has_value() {
                let value = sample.format_value();
                pairs.push((point_key.clone(), value.clone()));
                let value_str = String::from_utf8_lossy(&value).into_owned();
                if self.config.hash_layout {
                    let hash_key = format!(
                        "{}:{}:{}",
                        self.config.key_prefix,
                        sample.channel_id,
                        sample.kind.tag()
                    );
                    notifications.push((
                        hash_key.clone(),
                        format!("{}:{}", sample.point_id, value_str),
                    ));
                    hash_updates
                        .entry(hash_key)
                        .or_default()
                        .push((sample.point_id.to_string(), value));
                } else {
                    notifications.push((point_key, format!("{}:{}", sample.point_id, value_str)));
                }
            }

            let previous = self
                .last_quality
                .insert((sample.channel_id, sample.point_id), sample.quality);
            if sample.quality == Quality::Good {
                if previous.is_some_and(|q| q != Quality::Good) {
                    quality_clears.push((sample.channel_id, sample.point_id));
                }
            } else {
                quality_sets
                    .entry(sample.channel_id)
                    .or_default()
                    .push((
                        sample.point_id.to_string(),
                        Bytes::from_static(sample.quality.tag().as_bytes()),
                    ));
            }
        }

        for (channel_id, record) in &statuses {
            pairs.push((
                format!("{}:status:{}", self.config.key_prefix, channel_id),
                Bytes::from(record.clone()),
            ));
        }
        for (command_id, record) in &command_statuses {
            pairs.push((
                format!("{}:cmdstatus:{}", self.config.key_prefix, command_id),
                Bytes::from(record.clone()),
            ));
        }

        if !self.write_with_retry(&pairs, &hash_updates, &quality_sets, &quality_clears).await {
            self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
            error!(
                samples = batch.len(),
                "dropping publish batch after {} failed flush attempts",
                self.config.flush_retries
            );
            return;
        }
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);

        // Notifications go out only after the store write succeeded, in
        // sample order.
        for (channel, payload) in notifications {
            if let Err(e) = self.rtdb.publish(&channel, &payload).await {
                self.stats.notify_failures.fetch_add(1, Ordering::Relaxed);
                warn!("notify {channel} failed: {e}");
            }
        }
    }

    async fn write_with_retry(
        &self,
        pairs: &[(String, Bytes)],
        hash_updates: &HashMap<String, Vec<(String, Bytes)>>,
        quality_sets: &HashMap<u16, Vec<(String, Bytes)>>,
        quality_clears: &[(u16, u32)],
    ) -> bool {
        let mut delay = self.config.retry_initial;
        for attempt in 0..=self.config.flush_retries {
            match self
                .try_write(pairs, hash_updates, quality_sets, quality_clears)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    self.stats.flush_retries.fetch_add(1, Ordering::Relaxed);
                    warn!("store flush attempt {attempt} failed: {e}");
                    if attempt < self.config.flush_retries {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(5));
                    }
                },
            }
        }
        false
    }

    async fn try_write(
        &self,
        pairs: &[(String, Bytes)],
        hash_updates: &HashMap<String, Vec<(String, Bytes)>>,
        quality_sets: &HashMap<u16, Vec<(String, Bytes)>>,
        quality_clears: &[(u16, u32)],
    ) -> comsrv_rtdb::Result<()> {
        self.rtdb.mset(pairs).await?;
        for (key, fields) in hash_updates {
            self.rtdb.hash_mset(key, fields.clone()).await?;
        }
        for (channel_id, fields) in quality_sets {
            let key = format!("{}:quality:{}", self.config.key_prefix, channel_id);
            self.rtdb.hash_mset(&key, fields.clone()).await?;
        }
        for (channel_id, point_id) in quality_clears {
            let key = format!("{}:quality:{}", self.config.key_prefix, channel_id);
            self.rtdb.hash_del(&key, &point_id.to_string()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{PointKind, Quality, ScalarType, Timestamp};
    use comsrv_rtdb::MemoryRtdb;

    fn sample(point_id: u32, value: f64, quality: Quality) -> Sample {
        Sample {
            channel_id: 1001,
            point_id,
            kind: PointKind::Telemetry,
            scalar: ScalarType::Uint16,
            raw: value as u64,
            value,
            timestamp: Timestamp::now(),
            quality,
        }
    }

    #[tokio::test]
    async fn writes_value_key_and_notifies_after_store() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let (publisher, task) = Publisher::spawn(rtdb.clone(), PublisherConfig::default());

        publisher.write(sample(10001, 2.5, Quality::Good)).await.unwrap();
        publisher.flush().await.unwrap();

        assert_eq!(
            rtdb.string_value("1001:m:10001").as_deref(),
            Some("2.500000")
        );
        assert_eq!(
            rtdb.published_messages(),
            vec![("1001:m:10001".to_string(), "10001:2.500000".to_string())]
        );

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn preserves_per_channel_fifo_order() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let (publisher, task) = Publisher::spawn(rtdb.clone(), PublisherConfig::default());

        for i in 0..10 {
            publisher
                .write(sample(10001, f64::from(i), Quality::Good))
                .await
                .unwrap();
        }
        publisher.flush().await.unwrap();

        let notified: Vec<String> = rtdb
            .published_messages()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("10001:{i}.000000")).collect();
        assert_eq!(notified, expected);
        // Final store value is the last write.
        assert_eq!(
            rtdb.string_value("1001:m:10001").as_deref(),
            Some("9.000000")
        );

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn comm_fail_sets_quality_without_touching_value() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let (publisher, task) = Publisher::spawn(rtdb.clone(), PublisherConfig::default());

        publisher.write(sample(10001, 2.5, Quality::Good)).await.unwrap();
        publisher.flush().await.unwrap();
        publisher
            .write(sample(10001, 0.0, Quality::CommFail))
            .await
            .unwrap();
        publisher.flush().await.unwrap();

        // Last good value survives; the quality hash carries the mark.
        assert_eq!(
            rtdb.string_value("1001:m:10001").as_deref(),
            Some("2.500000")
        );
        let quality = rtdb.hash_get("comsrv:quality:1001", "10001").await.unwrap();
        assert_eq!(quality, Some(Bytes::from_static(b"COMM_FAIL")));

        // Recovery clears the mark.
        publisher.write(sample(10001, 3.0, Quality::Good)).await.unwrap();
        publisher.flush().await.unwrap();
        let quality = rtdb.hash_get("comsrv:quality:1001", "10001").await.unwrap();
        assert_eq!(quality, None);

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn range_publishes_value_and_quality() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let (publisher, task) = Publisher::spawn(rtdb.clone(), PublisherConfig::default());

        publisher.write(sample(10001, 99.0, Quality::Range)).await.unwrap();
        publisher.flush().await.unwrap();

        assert_eq!(
            rtdb.string_value("1001:m:10001").as_deref(),
            Some("99.000000")
        );
        let quality = rtdb.hash_get("comsrv:quality:1001", "10001").await.unwrap();
        assert_eq!(quality, Some(Bytes::from_static(b"RANGE")));

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn hash_layout_mirrors_values() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let config = PublisherConfig {
            hash_layout: true,
            ..PublisherConfig::default()
        };
        let (publisher, task) = Publisher::spawn(rtdb.clone(), config);

        publisher.write(sample(10001, 2.5, Quality::Good)).await.unwrap();
        publisher.flush().await.unwrap();

        let field = rtdb.hash_get("comsrv:1001:m", "10001").await.unwrap();
        assert_eq!(field, Some(Bytes::from_static(b"2.500000")));
        // Notification goes to the hash key in this layout.
        assert_eq!(
            rtdb.published_messages()[0].0,
            "comsrv:1001:m".to_string()
        );

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn status_record_written_under_reserved_key() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let (publisher, task) = Publisher::spawn(rtdb.clone(), PublisherConfig::default());

        publisher
            .write_status(1001, r#"{"connected":true}"#.to_string())
            .await
            .unwrap();
        publisher.flush().await.unwrap();

        assert_eq!(
            rtdb.string_value("comsrv:status:1001").as_deref(),
            Some(r#"{"connected":true}"#)
        );

        drop(publisher);
        task.join().await;
    }

    #[tokio::test]
    async fn batch_flushes_at_batch_size_without_explicit_flush() {
        let rtdb = Arc::new(MemoryRtdb::new());
        let config = PublisherConfig {
            batch_size: 5,
            max_wait: Duration::from_secs(60),
            ..PublisherConfig::default()
        };
        let (publisher, task) = Publisher::spawn(rtdb.clone(), config);

        for i in 0..5 {
            publisher
                .write(sample(10001 + i, 1.0, Quality::Good))
                .await
                .unwrap();
        }
        // Size-triggered flush, no flush() call.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rtdb.published_messages().len(), 5);
        assert_eq!(publisher.stats().batches_flushed, 1);

        drop(publisher);
        task.join().await;
    }
}
