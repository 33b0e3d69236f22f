//! Command intake from the realtime store
//!
//! Downstream services issue controls and setpoints by publishing JSON
//! envelopes on `cmd:{channel_id}:control` and `cmd:{channel_id}:setpoint`.
//! Each envelope is queued on the channel runtime; the terminal outcome is
//! written under the reserved command-status key.

use comsrv_rtdb::Rtdb;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{Command, CommandEnvelope, CommandStatusRecord, CommandValue};
use super::runtime::CommandSubmitter;
use crate::publisher::Publisher;

/// Fallback wait for a command outcome when the envelope has no deadline.
const DEFAULT_REPLY_WAIT: Duration = Duration::from_secs(30);

/// Pub/sub channel names for one communication channel.
pub fn command_channels(channel_id: u16) -> Vec<String> {
    vec![
        format!("cmd:{channel_id}:control"),
        format!("cmd:{channel_id}:setpoint"),
    ]
}

/// Start the command subscription task for one channel.
pub fn spawn_command_subscriber(
    rtdb: Arc<dyn Rtdb>,
    publisher: Publisher,
    channel_id: u16,
    submitter: CommandSubmitter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channels = command_channels(channel_id);
        let mut rx = match rtdb.subscribe(&channels).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(channel = channel_id, "command subscription failed: {e}");
                return;
            },
        };
        info!(channel = channel_id, "command subscriber started");

        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(m) => m,
                    None => {
                        warn!(channel = channel_id, "command subscription closed");
                        break;
                    },
                },
            };

            let envelope: CommandEnvelope = match serde_json::from_str(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(channel = channel_id, "invalid command payload: {e}");
                    continue;
                },
            };
            if envelope.channel_id != channel_id {
                warn!(
                    channel = channel_id,
                    envelope_channel = envelope.channel_id,
                    "command addressed to a different channel, ignoring"
                );
                continue;
            }

            let value = if message.channel.ends_with(":control") {
                CommandValue::Discrete(envelope.value != 0.0)
            } else {
                CommandValue::Analog(envelope.value)
            };
            let reply_wait = envelope
                .deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REPLY_WAIT);

            let mut cmd =
                Command::new(envelope.point_id, value).with_confirm(envelope.confirm);
            if let Some(ms) = envelope.deadline_ms {
                cmd = cmd.with_deadline(Instant::now() + Duration::from_millis(ms));
            }
            let (cmd, reply) = cmd.with_reply();

            debug!(
                channel = channel_id,
                point = envelope.point_id,
                command = %envelope.command_id,
                "command received"
            );

            let record = match submitter.submit(cmd) {
                Err(e) => CommandStatusRecord::failed(envelope.command_id, e.to_string()),
                Ok(()) => match tokio::time::timeout(reply_wait, reply).await {
                    Ok(Ok(Ok(()))) => CommandStatusRecord::success(envelope.command_id),
                    Ok(Ok(Err(e))) => {
                        CommandStatusRecord::failed(envelope.command_id, e.to_string())
                    },
                    Ok(Err(_)) => CommandStatusRecord::failed(
                        envelope.command_id,
                        "channel stopped before completion".to_string(),
                    ),
                    Err(_) => CommandStatusRecord::failed(
                        envelope.command_id,
                        "no outcome within deadline".to_string(),
                    ),
                },
            };

            let command_id = record.command_id.clone();
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = publisher.write_command_status(&command_id, json).await {
                        warn!(channel = channel_id, "command status write failed: {e}");
                    }
                },
                Err(e) => warn!(channel = channel_id, "command status encode failed: {e}"),
            }
        }
        info!(channel = channel_id, "command subscriber stopped");
    })
}
