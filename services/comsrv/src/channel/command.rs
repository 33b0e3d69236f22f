//! Outbound command types
//!
//! Commands target CONTROL (digital) and SETPOINT (analog) points. They
//! arrive either through the supervisor API or from the store's pub/sub
//! command channels, and are queued on the owning channel runtime.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Result;

/// Target value of a write request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandValue {
    /// Digital control state
    Discrete(bool),
    /// Analog setpoint in engineering units
    Analog(f64),
}

/// A queued write request for one output point.
#[derive(Debug)]
pub struct Command {
    pub point_id: u32,
    pub value: CommandValue,
    /// Read the value back from the device after the acknowledgement and
    /// publish that instead of the commanded value (best effort).
    pub confirm: bool,
    /// Absolute expiry; defaults to the channel's request timeout when unset
    pub deadline: Option<Instant>,
    reply: Option<oneshot::Sender<Result<()>>>,
}

impl Command {
    pub fn new(point_id: u32, value: CommandValue) -> Self {
        Self {
            point_id,
            value,
            confirm: false,
            deadline: None,
            reply: None,
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a completion channel; the caller awaits the receiver.
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Deliver the outcome to the submitter, if anyone is listening.
    pub fn resolve(&mut self, result: Result<()>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }
}

/// JSON shape of a command received on `cmd:{channel_id}:control` or
/// `cmd:{channel_id}:setpoint`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub channel_id: u16,
    pub point_id: u32,
    pub value: f64,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// Terminal command status written under the reserved command-status key.
#[derive(Debug, Clone, Serialize)]
pub struct CommandStatusRecord {
    pub command_id: String,
    pub status: String,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl CommandStatusRecord {
    pub fn success(command_id: String) -> Self {
        Self {
            command_id,
            status: "success".to_string(),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(command_id: String, error: String) -> Self {
        Self {
            command_id,
            status: "failed".to_string(),
            error: Some(error),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
