//! Channel scheduler task
//!
//! Drives one channel end to end: reconnect with backoff, poll the point
//! model on its cadence, interleave queued commands between read groups,
//! decode samples and hand them to the publisher. The task exclusively
//! owns its driver and transport; the supervisor talks to it through the
//! `ChannelHandle` only.

use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::command::{Command, CommandValue};
use super::status::{ChannelState, ChannelStatus};
use crate::config::ChannelConfig;
use crate::error::{ComSrvError, Result};
use crate::points::{
    decode_group, encode_output_registers, fail_group, Point, PointModel, Quality, ReadGroup,
    Sample, Timestamp,
};
use crate::protocol::{Driver, FunctionCode, WriteValue, WriteValues};
use crate::publisher::Publisher;

/// Timing and sizing parameters for one channel task.
#[derive(Debug, Clone)]
pub struct ChannelRuntimeConfig {
    pub channel_id: u16,
    pub name: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub command_queue_depth: usize,
}

impl From<&ChannelConfig> for ChannelRuntimeConfig {
    fn from(cfg: &ChannelConfig) -> Self {
        Self {
            channel_id: cfg.id,
            name: cfg.name.clone(),
            poll_interval: cfg.poll_interval(),
            timeout: cfg.timeout(),
            failure_threshold: cfg.failure_threshold,
            command_queue_depth: cfg.command_queue_depth,
        }
    }
}

/// Supervisor-side handle to a running channel task.
pub struct ChannelHandle {
    pub channel_id: u16,
    cmd_tx: mpsc::Sender<Command>,
    model: Arc<ArcSwap<PointModel>>,
    status_rx: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Clonable command-queue front end, handed to command intake tasks.
#[derive(Clone)]
pub struct CommandSubmitter {
    cmd_tx: mpsc::Sender<Command>,
}

impl CommandSubmitter {
    /// Queue a command. Rejected with BUSY when the queue is full.
    pub fn submit(&self, cmd: Command) -> Result<()> {
        match self.cmd_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(mut cmd)) => {
                cmd.resolve(Err(ComSrvError::Busy));
                Err(ComSrvError::Busy)
            },
            Err(mpsc::error::TrySendError::Closed(mut cmd)) => {
                cmd.resolve(Err(ComSrvError::Cancelled));
                Err(ComSrvError::Cancelled)
            },
        }
    }
}

impl ChannelHandle {
    /// Queue a command. Rejected with BUSY when the queue is full.
    pub fn submit(&self, cmd: Command) -> Result<()> {
        self.submitter().submit(cmd)
    }

    /// Front end for external command sources.
    pub fn submitter(&self) -> CommandSubmitter {
        CommandSubmitter {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Atomically replace the point model. In-flight cycles finish on the
    /// model they loaded; the next tick plans from the new one.
    pub fn swap_model(&self, model: PointModel) {
        self.model.store(Arc::new(model));
    }

    pub fn model(&self) -> Arc<PointModel> {
        self.model.load_full()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status_rx.borrow().clone()
    }

    /// Request a stop and wait for the task, aborting after `deadline`.
    pub async fn stop(mut self, deadline: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(deadline, &mut self.join).await.is_err() {
            warn!(channel = self.channel_id, "graceful stop deadline exceeded, aborting task");
            self.join.abort();
            let _ = self.join.await;
        }
    }
}

/// Start the channel task. The driver must not be connected yet; the task
/// owns the whole connect/poll/reconnect lifecycle.
pub fn spawn_channel(
    cfg: ChannelRuntimeConfig,
    model: PointModel,
    driver: Driver,
    publisher: Publisher,
) -> ChannelHandle {
    let channel_id = cfg.channel_id;
    let model = Arc::new(ArcSwap::from_pointee(model));
    let (cmd_tx, cmd_rx) = mpsc::channel(cfg.command_queue_depth);
    let cancel = CancellationToken::new();
    let status_name = cfg.name.clone();
    let (status_tx, status_rx) = watch::channel(ChannelStatus::new(channel_id, cfg.name.clone()));

    let task = ChannelTask {
        cfg,
        model: model.clone(),
        driver,
        publisher,
        cmd_rx,
        cancel: cancel.clone(),
        status: ChannelStatus::new(channel_id, status_name),
        status_tx,
    };
    let join = tokio::spawn(task.run());

    ChannelHandle {
        channel_id,
        cmd_tx,
        model,
        status_rx,
        cancel,
        join,
    }
}

enum LoopExit {
    Cancelled,
    Reconnect,
}

struct ChannelTask {
    cfg: ChannelRuntimeConfig,
    model: Arc<ArcSwap<PointModel>>,
    driver: Driver,
    publisher: Publisher,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    status: ChannelStatus,
    status_tx: watch::Sender<ChannelStatus>,
}

impl ChannelTask {
    async fn run(mut self) {
        info!(channel = self.cfg.channel_id, name = %self.cfg.name, "channel starting");
        let mut first = true;
        loop {
            self.set_state(if first {
                ChannelState::Starting
            } else {
                ChannelState::Reconnecting
            })
            .await;
            first = false;

            if !self.connect_with_backoff().await {
                break;
            }
            self.status.metrics.last_connect = Some(Utc::now());
            self.set_state(ChannelState::Running).await;

            match self.poll_loop().await {
                LoopExit::Cancelled => break,
                LoopExit::Reconnect => {
                    self.driver.close().await;
                },
            }
        }

        self.set_state(ChannelState::Stopping).await;
        self.reject_queued_commands();
        self.driver.close().await;
        self.set_state(ChannelState::Stopped).await;
        info!(channel = self.cfg.channel_id, "channel stopped");
    }

    /// Reconnect until it succeeds or the task is cancelled.
    async fn connect_with_backoff(&mut self) -> bool {
        let mut backoff = Backoff::reconnect();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.driver.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    self.status.metrics.last_error = Some(e.to_string());
                    self.push_status().await;
                    let delay = backoff.next_delay();
                    warn!(
                        channel = self.cfg.channel_id,
                        "connect failed: {e}, next attempt in {delay:?}"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return false,
                        () = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    /// Poll cadence: if a cycle overruns the interval, the next one starts
    /// immediately; missed ticks are never queued.
    async fn poll_loop(&mut self) -> LoopExit {
        loop {
            let cycle_start = Instant::now();
            let model = self.model.load_full();

            if let Some(exit) = self.drain_commands(&model).await {
                return exit;
            }

            for group in model.plan_reads() {
                if self.cancel.is_cancelled() {
                    return LoopExit::Cancelled;
                }
                // Commands are interleaved between read groups, never
                // preempting an in-flight request.
                if let Some(exit) = self.drain_commands(&model).await {
                    return exit;
                }
                if let Err(exit) = self.execute_group(&model, &group).await {
                    return exit;
                }
            }

            self.push_status().await;
            self.write_store_status().await;

            let wake = cycle_start + self.cfg.poll_interval;
            if let Some(exit) = self.sleep_until_tick(wake).await {
                return exit;
            }
        }
    }

    /// Wait for the next tick while staying responsive to commands.
    async fn sleep_until_tick(&mut self, wake: Instant) -> Option<LoopExit> {
        loop {
            if Instant::now() >= wake {
                return None;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Some(LoopExit::Cancelled),
                () = tokio::time::sleep_until(wake) => return None,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // All senders gone; nothing left to interleave.
                        tokio::select! {
                            () = self.cancel.cancelled() => return Some(LoopExit::Cancelled),
                            () = tokio::time::sleep_until(wake) => return None,
                        }
                    };
                    let model = self.model.load_full();
                    if let Err(exit) = self.handle_command(&model, cmd).await {
                        return Some(exit);
                    }
                },
            }
        }
    }

    async fn execute_group(
        &mut self,
        model: &PointModel,
        group: &ReadGroup,
    ) -> std::result::Result<(), LoopExit> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(LoopExit::Cancelled),
            result = self.driver.read(group, self.cfg.timeout) => result,
        };
        let stats = self.driver.take_stats();
        self.status.metrics.absorb_link_stats(&stats);

        match result {
            Ok(payload) => {
                self.status.metrics.record_success();
                let samples = decode_group(self.cfg.channel_id, model, group, &payload);
                self.publish_samples(samples).await;
                Ok(())
            },
            Err(e) => {
                let service_error: ComSrvError = e.into();
                self.status
                    .metrics
                    .record_failure(&service_error.to_string());
                debug!(
                    channel = self.cfg.channel_id,
                    start = group.start,
                    "read group failed: {service_error}"
                );
                let samples = fail_group(self.cfg.channel_id, model, group, Quality::CommFail);
                self.publish_samples(samples).await;
                self.push_status().await;

                let link_down = matches!(
                    service_error,
                    ComSrvError::Io(_) | ComSrvError::ConnectFailed(_)
                );
                if link_down
                    || self.status.metrics.consecutive_failures >= self.cfg.failure_threshold
                {
                    Err(LoopExit::Reconnect)
                } else {
                    Ok(())
                }
            },
        }
    }

    async fn drain_commands(&mut self, model: &PointModel) -> Option<LoopExit> {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => {
                    if let Err(exit) = self.handle_command(model, cmd).await {
                        return Some(exit);
                    }
                },
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }
    }

    async fn handle_command(
        &mut self,
        model: &PointModel,
        mut cmd: Command,
    ) -> std::result::Result<(), LoopExit> {
        if cmd.expired(Instant::now()) {
            cmd.resolve(Err(ComSrvError::Timeout(
                "command deadline expired while queued".to_string(),
            )));
            return Ok(());
        }

        let outcome = self.execute_command(model, &cmd).await;
        let stats = self.driver.take_stats();
        self.status.metrics.absorb_link_stats(&stats);

        match outcome {
            Ok(confirmation) => {
                self.status.metrics.record_success();
                cmd.resolve(Ok(()));
                self.publish_samples(vec![confirmation]).await;
                Ok(())
            },
            Err(e) => {
                self.status.metrics.record_failure(&e.to_string());
                let link_down = matches!(e, ComSrvError::Io(_) | ComSrvError::ConnectFailed(_));
                cmd.resolve(Err(e));
                self.push_status().await;
                if link_down {
                    Err(LoopExit::Reconnect)
                } else {
                    Ok(())
                }
            },
        }
    }

    /// Deliver one write to the device and produce the confirmation sample
    /// that is published on success.
    async fn execute_command(&mut self, model: &PointModel, cmd: &Command) -> Result<Sample> {
        let point = model
            .get(cmd.point_id)
            .ok_or_else(|| ComSrvError::PointNotFound(cmd.point_id.to_string()))?
            .clone();
        let timeout = match cmd.deadline {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
                .min(self.cfg.timeout),
            None => self.cfg.timeout,
        };
        let address = point.address;

        match (point.kind, cmd.value) {
            (crate::points::PointKind::Control, CommandValue::Discrete(on)) => {
                match address.function_code {
                    FunctionCode::WriteSingleCoil => {
                        self.driver
                            .write_single(
                                address.unit_id,
                                address.function_code,
                                address.address,
                                WriteValue::Coil(on),
                                timeout,
                            )
                            .await?
                    },
                    FunctionCode::WriteMultipleCoils => {
                        self.driver
                            .write_multiple(
                                address.unit_id,
                                address.function_code,
                                address.address,
                                &WriteValues::Coils(vec![on]),
                                timeout,
                            )
                            .await?
                    },
                    other => {
                        return Err(ComSrvError::NotImplemented(format!(
                            "control write with function code 0x{:02X}",
                            u8::from(other)
                        )))
                    },
                }
            },
            (crate::points::PointKind::Setpoint, CommandValue::Analog(value)) => {
                let registers = encode_output_registers(&point, value)?;
                match address.function_code {
                    FunctionCode::WriteSingleRegister => {
                        self.driver
                            .write_single(
                                address.unit_id,
                                address.function_code,
                                address.address,
                                WriteValue::Register(registers[0]),
                                timeout,
                            )
                            .await?
                    },
                    FunctionCode::WriteMultipleRegisters => {
                        self.driver
                            .write_multiple(
                                address.unit_id,
                                address.function_code,
                                address.address,
                                &WriteValues::Registers(registers),
                                timeout,
                            )
                            .await?
                    },
                    other => {
                        return Err(ComSrvError::NotImplemented(format!(
                            "setpoint write with function code 0x{:02X}",
                            u8::from(other)
                        )))
                    },
                }
            },
            (kind, _) => {
                return Err(ComSrvError::NotImplemented(format!(
                    "command value does not match point kind {kind:?}"
                )))
            },
        }

        if cmd.confirm {
            if let Some(sample) = self.read_back(model, &point, timeout).await {
                return Ok(sample);
            }
        }
        Ok(confirmation_sample(self.cfg.channel_id, &point, cmd.value))
    }

    /// Best-effort read-back after an acknowledged write. Falls back to the
    /// commanded value when the paired read fails.
    async fn read_back(
        &mut self,
        model: &PointModel,
        point: &Point,
        timeout: Duration,
    ) -> Option<Sample> {
        let read_fc = point.address.function_code.paired_read()?;
        let count = if read_fc.is_bit_addressed() {
            1
        } else {
            point.address.register_span()
        };
        let group = ReadGroup {
            unit_id: point.address.unit_id,
            function_code: read_fc,
            start: point.address.address,
            count,
            point_ids: vec![point.id],
        };
        match self.driver.read(&group, timeout).await {
            Ok(payload) => decode_group(self.cfg.channel_id, model, &group, &payload)
                .into_iter()
                .next(),
            Err(e) => {
                debug!(
                    channel = self.cfg.channel_id,
                    point = point.id,
                    "confirm read-back failed: {e}"
                );
                None
            },
        }
    }

    async fn publish_samples(&mut self, samples: Vec<Sample>) {
        for sample in samples {
            if let Err(e) = self.publisher.write(sample).await {
                warn!(channel = self.cfg.channel_id, "publish failed: {e}");
            }
        }
    }

    /// Close the queue and answer everything left with CANCELLED.
    fn reject_queued_commands(&mut self) {
        self.cmd_rx.close();
        while let Ok(mut cmd) = self.cmd_rx.try_recv() {
            cmd.resolve(Err(ComSrvError::Cancelled));
        }
    }

    async fn set_state(&mut self, state: ChannelState) {
        if self.status.state != state {
            self.status.state = state;
            self.push_status().await;
            self.write_store_status().await;
        }
    }

    async fn push_status(&mut self) {
        let _ = self.status_tx.send_replace(self.status.clone());
    }

    async fn write_store_status(&mut self) {
        let record = self.status.store_record();
        if let Err(e) = self
            .publisher
            .write_status(self.cfg.channel_id, record)
            .await
        {
            warn!(channel = self.cfg.channel_id, "status write failed: {e}");
        }
    }
}

/// Confirmation sample for an acknowledged command, carrying the commanded
/// value.
fn confirmation_sample(channel_id: u16, point: &Point, value: CommandValue) -> Sample {
    let (raw, engineering) = match value {
        CommandValue::Discrete(on) => (u64::from(on), f64::from(u8::from(on))),
        CommandValue::Analog(v) => {
            let raw = encode_output_registers(point, v)
                .ok()
                .and_then(|regs| crate::points::decode::combine_registers(&regs, point.byte_order).ok())
                .unwrap_or(0);
            (raw, v)
        },
    };
    let quality = if point.in_range(engineering) {
        Quality::Good
    } else {
        Quality::Range
    };
    Sample {
        channel_id,
        point_id: point.id,
        kind: point.kind,
        scalar: point.scalar,
        raw,
        value: engineering,
        timestamp: Timestamp::now(),
        quality,
    }
}
