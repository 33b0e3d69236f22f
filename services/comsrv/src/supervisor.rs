//! Supervisor
//!
//! Top-level owner of all channels. Loads configuration, starts one
//! runtime task per enabled channel, applies reconfiguration diffs, and
//! exposes status snapshots. The store handle and publisher settings are
//! explicit constructor inputs; nothing here is a process-wide singleton.

use comsrv_rtdb::Rtdb;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{
    spawn_channel, spawn_command_subscriber, ChannelHandle, ChannelRuntimeConfig, ChannelStatus,
    Command,
};
use crate::config::{self, AppConfig, ChannelConfig, TransportSpec};
use crate::error::{ComSrvError, Result};
use crate::points::PointModel;
use crate::protocol::{build_driver, Driver, ModbusFlavor};
use crate::publisher::{Publisher, PublisherConfig, PublisherTask};
use crate::transport::{open_transport, serial};

/// Default grace period for stopping a channel before its task is aborted.
const STOP_DEADLINE: Duration = Duration::from_secs(10);

struct ManagedChannel {
    cfg: ChannelConfig,
    handle: ChannelHandle,
    subscriber_cancel: CancellationToken,
    subscriber: JoinHandle<()>,
}

/// Top-level owner of channels, publisher and command intake.
pub struct Supervisor {
    rtdb: Arc<dyn Rtdb>,
    publisher: Publisher,
    publisher_task: Option<PublisherTask>,
    channels: HashMap<u16, ManagedChannel>,
    stop_deadline: Duration,
}

impl Supervisor {
    pub fn new(rtdb: Arc<dyn Rtdb>, publisher_config: PublisherConfig) -> Self {
        let (publisher, publisher_task) = Publisher::spawn(rtdb.clone(), publisher_config);
        Self {
            rtdb,
            publisher,
            publisher_task: Some(publisher_task),
            channels: HashMap::new(),
            stop_deadline: STOP_DEADLINE,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Build and start every enabled channel. A channel that fails to
    /// build is reported and skipped; the others still start.
    pub async fn load(&mut self, cfg: &AppConfig) -> Result<()> {
        let mut started = 0usize;
        let mut failed = 0usize;
        for channel_cfg in &cfg.channels {
            if !channel_cfg.enabled {
                info!(channel = channel_cfg.id, "channel disabled, skipping");
                continue;
            }
            match self.start_channel(channel_cfg).await {
                Ok(()) => started += 1,
                Err(e) => {
                    failed += 1;
                    error!(channel = channel_cfg.id, "channel failed to start: {e}");
                },
            }
        }
        info!(started, failed, "configuration loaded");
        Ok(())
    }

    /// Apply a configuration diff: stop removed channels, start added
    /// ones, and reconfigure changed ones. A changed point table alone
    /// hot-swaps the model; a changed link restarts the channel.
    pub async fn update(&mut self, cfg: &AppConfig) -> Result<()> {
        let desired: HashMap<u16, &ChannelConfig> = cfg
            .channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.id, c))
            .collect();

        let removed: Vec<u16> = self
            .channels
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            info!(channel = id, "channel removed from configuration");
            self.stop_channel(id).await;
        }

        for (id, channel_cfg) in desired {
            let current = self.channels.get(&id).map(|m| m.cfg.clone());
            match current {
                None => {
                    if let Err(e) = self.start_channel(channel_cfg).await {
                        error!(channel = id, "channel failed to start: {e}");
                    }
                },
                Some(existing) if existing == *channel_cfg => {
                    // Unchanged; applying the same configuration twice is
                    // a no-op.
                },
                Some(existing) if existing.same_link(channel_cfg) => {
                    info!(channel = id, "point table changed, hot-swapping model");
                    match build_model(channel_cfg) {
                        Ok(model) => {
                            if let Some(managed) = self.channels.get_mut(&id) {
                                managed.handle.swap_model(model);
                                managed.cfg = channel_cfg.clone();
                            }
                        },
                        Err(e) => error!(channel = id, "point table reload failed: {e}"),
                    }
                },
                Some(_) => {
                    info!(channel = id, "link configuration changed, restarting channel");
                    self.stop_channel(id).await;
                    if let Err(e) = self.start_channel(channel_cfg).await {
                        error!(channel = id, "channel failed to restart: {e}");
                    }
                },
            }
        }
        Ok(())
    }

    /// Re-read a channel's point table from disk and swap the model in.
    pub async fn reload_points(&mut self, channel_id: u16) -> Result<()> {
        let managed = self
            .channels
            .get(&channel_id)
            .ok_or(ComSrvError::ChannelNotFound(channel_id))?;
        let model = build_model(&managed.cfg)?;
        managed.handle.swap_model(model);
        Ok(())
    }

    /// Replace a channel's point model directly.
    pub fn swap_model(&self, channel_id: u16, model: PointModel) -> Result<()> {
        let managed = self
            .channels
            .get(&channel_id)
            .ok_or(ComSrvError::ChannelNotFound(channel_id))?;
        managed.handle.swap_model(model);
        Ok(())
    }

    /// Queue a command on a channel.
    pub fn submit_command(&self, channel_id: u16, cmd: Command) -> Result<()> {
        let managed = self
            .channels
            .get(&channel_id)
            .ok_or(ComSrvError::ChannelNotFound(channel_id))?;
        managed.handle.submit(cmd)
    }

    /// Snapshot of every channel's state and metrics.
    pub fn status(&self) -> Vec<ChannelStatus> {
        let mut statuses: Vec<ChannelStatus> =
            self.channels.values().map(|m| m.handle.status()).collect();
        statuses.sort_by_key(|s| s.channel_id);
        statuses
    }

    pub fn channel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop all channels, flush the publisher, and release the store.
    pub async fn shutdown(mut self) {
        info!("supervisor shutting down");
        let ids: Vec<u16> = self.channels.keys().copied().collect();
        for id in ids {
            self.stop_channel(id).await;
        }
        if let Err(e) = self.publisher.flush().await {
            warn!("final publisher flush failed: {e}");
        }
        let Self {
            publisher,
            publisher_task,
            ..
        } = self;
        drop(publisher);
        if let Some(task) = publisher_task {
            task.join().await;
        }
        info!("supervisor stopped");
    }

    async fn start_channel(&mut self, cfg: &ChannelConfig) -> Result<()> {
        cfg.validate()?;
        if self.channels.contains_key(&cfg.id) {
            return Err(ComSrvError::internal(format!(
                "channel {} is already running",
                cfg.id
            )));
        }

        let model = build_model(cfg)?;
        let transport = open_transport(&cfg.transport)?;
        let flavor = modbus_flavor(cfg);
        let driver: Driver = build_driver(cfg.protocol, cfg.role, transport, flavor, cfg.retry_count)?;

        let handle = spawn_channel(
            ChannelRuntimeConfig::from(cfg),
            model,
            driver,
            self.publisher.clone(),
        );
        let subscriber_cancel = CancellationToken::new();
        let subscriber = spawn_command_subscriber(
            self.rtdb.clone(),
            self.publisher.clone(),
            cfg.id,
            handle.submitter(),
            subscriber_cancel.clone(),
        );

        info!(channel = cfg.id, name = %cfg.name, "channel started");
        self.channels.insert(
            cfg.id,
            ManagedChannel {
                cfg: cfg.clone(),
                handle,
                subscriber_cancel,
                subscriber,
            },
        );
        Ok(())
    }

    async fn stop_channel(&mut self, channel_id: u16) {
        let Some(managed) = self.channels.remove(&channel_id) else {
            return;
        };
        managed.subscriber_cancel.cancel();
        managed.handle.stop(self.stop_deadline).await;
        if tokio::time::timeout(Duration::from_secs(1), managed.subscriber)
            .await
            .is_err()
        {
            warn!(channel = channel_id, "command subscriber did not stop in time");
        }
        info!(channel = channel_id, "channel stopped");
    }
}

/// Load and validate a channel's point table into a model.
fn build_model(cfg: &ChannelConfig) -> Result<PointModel> {
    let rows = config::load_point_rows(&cfg.point_table)?;
    PointModel::from_rows(&rows, cfg.coalesce_gap)
}

/// Framing follows the transport: serial links speak RTU, sockets MBAP.
fn modbus_flavor(cfg: &ChannelConfig) -> ModbusFlavor {
    match &cfg.transport {
        TransportSpec::Tcp { .. } => ModbusFlavor::Tcp,
        TransportSpec::Serial {
            baud,
            data_bits,
            stop_bits,
            parity,
            ..
        } => {
            let silence = match cfg.rtu_silence_ms {
                Some(ms) => Duration::from_millis(ms),
                None => serial::frame_silence(*baud, *data_bits, *stop_bits, *parity),
            };
            ModbusFlavor::Rtu { silence }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parity;
    use std::path::PathBuf;

    fn tcp_channel(id: u16) -> ChannelConfig {
        ChannelConfig {
            id,
            name: format!("ch-{id}"),
            protocol: Default::default(),
            role: Default::default(),
            transport: TransportSpec::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            poll_interval_ms: 1000,
            timeout_ms: 500,
            retry_count: 3,
            enabled: true,
            point_table: PathBuf::from("/nonexistent/points.csv"),
            coalesce_gap: 0,
            command_queue_depth: 64,
            failure_threshold: 5,
            rtu_silence_ms: None,
        }
    }

    #[test]
    fn tcp_channels_use_mbap_framing() {
        assert_eq!(modbus_flavor(&tcp_channel(1)), ModbusFlavor::Tcp);
    }

    #[test]
    fn serial_channels_use_rtu_with_computed_silence() {
        let mut cfg = tcp_channel(1);
        cfg.transport = TransportSpec::Serial {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        };
        match modbus_flavor(&cfg) {
            ModbusFlavor::Rtu { silence } => {
                assert!(silence >= Duration::from_micros(3500));
            },
            other => panic!("unexpected flavor: {other:?}"),
        }
    }

    #[test]
    fn rtu_silence_override_wins() {
        let mut cfg = tcp_channel(1);
        cfg.transport = TransportSpec::Serial {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        };
        cfg.rtu_silence_ms = Some(10);
        assert_eq!(
            modbus_flavor(&cfg),
            ModbusFlavor::Rtu {
                silence: Duration::from_millis(10)
            }
        );
    }

    #[tokio::test]
    async fn load_skips_channels_with_missing_tables() {
        let rtdb: Arc<dyn Rtdb> = Arc::new(comsrv_rtdb::MemoryRtdb::new());
        let mut supervisor = Supervisor::new(rtdb, PublisherConfig::default());
        let cfg = AppConfig {
            redis: Default::default(),
            log: Default::default(),
            channels: vec![tcp_channel(1)],
        };
        // Point table missing: the channel fails to build, load still
        // succeeds with zero channels running.
        supervisor.load(&cfg).await.unwrap();
        assert!(supervisor.channel_ids().is_empty());
        supervisor.shutdown().await;
    }
}
