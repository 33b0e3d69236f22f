//! Channel state and rolling metrics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::protocol::LinkStats;

/// EWMA weight for the average response time.
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    Stopping,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        self == ChannelState::Running
    }
}

/// Rolling per-channel counters, updated by the channel task only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub request_count: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub packet_errors: u64,
    /// EWMA of the response time, milliseconds
    pub avg_response_time_ms: f64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_connect: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ChannelMetrics {
    /// Fold one transaction's link counters into the rolling totals.
    pub fn absorb_link_stats(&mut self, stats: &LinkStats) {
        self.request_count += stats.requests;
        self.bytes_tx += stats.bytes_tx;
        self.bytes_rx += stats.bytes_rx;
        if let Some(elapsed) = stats.last_response_time {
            self.record_response_time(elapsed);
        }
    }

    pub fn record_response_time(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.avg_response_time_ms == 0.0 {
            self.avg_response_time_ms = ms;
        } else {
            self.avg_response_time_ms =
                self.avg_response_time_ms * (1.0 - RESPONSE_TIME_ALPHA) + ms * RESPONSE_TIME_ALPHA;
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &str) {
        self.packet_errors += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
    }
}

/// Snapshot of one channel's health, readable by the supervisor and
/// written to the store on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel_id: u16,
    pub name: String,
    pub state: ChannelState,
    pub metrics: ChannelMetrics,
}

impl ChannelStatus {
    pub fn new(channel_id: u16, name: String) -> Self {
        Self {
            channel_id,
            name,
            state: ChannelState::Stopped,
            metrics: ChannelMetrics::default(),
        }
    }

    /// Compact JSON record for the reserved status key.
    pub fn store_record(&self) -> String {
        #[derive(Serialize)]
        struct Record<'a> {
            connected: bool,
            state: ChannelState,
            last_success: Option<i64>,
            requests: u64,
            errors: u64,
            avg_response_time_ms: f64,
            last_error: Option<&'a str>,
        }
        let record = Record {
            connected: self.state.is_connected(),
            state: self.state,
            last_success: self.metrics.last_success.map(|t| t.timestamp_millis()),
            requests: self.metrics.request_count,
            errors: self.metrics.packet_errors,
            avg_response_time_ms: self.metrics.avg_response_time_ms,
            last_error: self.metrics.last_error.as_deref(),
        };
        serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string())
    }
}
