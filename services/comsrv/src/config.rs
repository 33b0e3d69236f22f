//! Configuration types and loading
//!
//! The main file is YAML merged with `COMSRV_`-prefixed environment
//! overrides through figment; per-channel point tables are CSV files, one
//! row per point. Only the parsed shapes matter to the rest of the server.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ComSrvError, Result};

/// Protocol spoken on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Modbus,
}

/// Side of the conversation this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    #[default]
    Master,
    Slave,
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Physical link parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSpec {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

fn default_baud() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}

/// One logical device connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub role: ChannelRole,
    pub transport: TransportSpec,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// CSV file with one row per point
    pub point_table: PathBuf,
    /// Maximum address gap bridged when coalescing reads
    #[serde(default)]
    pub coalesce_gap: u16,
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
    /// Consecutive whole-group failures before forcing a reconnect
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Override for the RTU end-of-frame silence, in milliseconds
    #[serde(default)]
    pub rtu_silence_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_retry_count() -> u32 {
    3
}
fn default_enabled() -> bool {
    true
}
fn default_command_queue_depth() -> usize {
    64
}
fn default_failure_threshold() -> u32 {
    5
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True when the two configurations differ only in their point table
    /// contents, so a reconfigure can hot-swap the model without a restart.
    pub fn same_link(&self, other: &ChannelConfig) -> bool {
        self.protocol == other.protocol
            && self.role == other.role
            && self.transport == other.transport
            && self.poll_interval_ms == other.poll_interval_ms
            && self.timeout_ms == other.timeout_ms
            && self.retry_count == other.retry_count
            && self.command_queue_depth == other.command_queue_depth
            && self.failure_threshold == other.failure_threshold
            && self.rtu_silence_ms == other.rtu_silence_ms
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ComSrvError::config(format!(
                "channel {}: name cannot be empty",
                self.id
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ComSrvError::config(format!(
                "channel {}: poll_interval_ms cannot be zero",
                self.id
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ComSrvError::config(format!(
                "channel {}: timeout_ms cannot be zero",
                self.id
            )));
        }
        if self.command_queue_depth == 0 {
            return Err(ComSrvError::config(format!(
                "channel {}: command_queue_depth cannot be zero",
                self.id
            )));
        }
        if self.role == ChannelRole::Slave {
            return Err(ComSrvError::NotImplemented(format!(
                "channel {}: slave role is not supported",
                self.id
            )));
        }
        Ok(())
    }
}

/// Realtime-store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Also mirror samples into per-kind hashes, for consumers that read
    /// the hash layout instead of flat keys
    #[serde(default)]
    pub hash_layout: bool,
    /// Prefix for reserved keys (status, quality, command status)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "comsrv".to_string()
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            hash_layout: false,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Log sink settings; the CLI can override both fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: Option<String>,
    pub dir: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl AppConfig {
    /// Load from a YAML file merged with `COMSRV_` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ComSrvError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let cfg: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("COMSRV_").split("__"))
            .extract()?;
        cfg.validate_ids()?;
        Ok(cfg)
    }

    fn validate_ids(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(ComSrvError::config(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

/// One CSV row of a point table. Missing optional columns fall back to the
/// documented defaults (scale=1, offset=0, byte_order=ABCD).
#[derive(Debug, Clone, Deserialize)]
pub struct PointRow {
    pub id: u32,
    pub kind: String,
    pub scalar_type: String,
    #[serde(default)]
    pub byte_order: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    pub unit_id: u8,
    pub function_code: u8,
    pub address: u16,
    #[serde(default)]
    pub bit_length: Option<u16>,
}

/// Read a point table CSV into rows; validation into typed points happens
/// in the point model layer.
pub fn load_point_rows(path: &Path) -> Result<Vec<PointRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| ComSrvError::config(format!("{}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<PointRow>() {
        rows.push(record.map_err(|e| ComSrvError::config(format!("{}: {e}", path.display())))?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_YAML: &str = r#"
redis:
  url: "redis://10.0.0.5:6379"
channels:
  - id: 1001
    name: "pcs-1"
    transport:
      type: tcp
      host: "192.168.1.10"
      port: 502
    point_table: "points/pcs1.csv"
  - id: 1002
    name: "meter-1"
    transport:
      type: serial
      port: "/dev/ttyUSB0"
      baud: 19200
      parity: even
    poll_interval_ms: 2000
    point_table: "points/meter1.csv"
    enabled: false
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let f = write_temp(SAMPLE_YAML);
        let cfg = AppConfig::load(f.path()).unwrap();
        assert_eq!(cfg.redis.url, "redis://10.0.0.5:6379");
        assert!(!cfg.redis.hash_layout);
        assert_eq!(cfg.channels.len(), 2);

        let ch = &cfg.channels[0];
        assert_eq!(ch.id, 1001);
        assert_eq!(ch.protocol, ProtocolKind::Modbus);
        assert_eq!(ch.role, ChannelRole::Master);
        assert_eq!(ch.poll_interval_ms, 1000);
        assert_eq!(ch.retry_count, 3);
        assert!(ch.enabled);
        assert_eq!(ch.command_queue_depth, 64);
        assert_eq!(ch.failure_threshold, 5);

        let ch = &cfg.channels[1];
        assert!(!ch.enabled);
        match &ch.transport {
            TransportSpec::Serial { baud, parity, data_bits, stop_bits, .. } => {
                assert_eq!(*baud, 19200);
                assert_eq!(*parity, Parity::Even);
                assert_eq!(*data_bits, 8);
                assert_eq!(*stop_bits, 1);
            },
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn duplicate_channel_ids_rejected() {
        let yaml = r#"
channels:
  - id: 1
    name: "a"
    transport: { type: tcp, host: "h", port: 502 }
    point_table: "a.csv"
  - id: 1
    name: "b"
    transport: { type: tcp, host: "h", port: 503 }
    point_table: "b.csv"
"#;
        let f = write_temp(yaml);
        assert!(AppConfig::load(f.path()).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = AppConfig::load(Path::new("/nonexistent/comsrv.yaml")).unwrap_err();
        assert!(matches!(err, ComSrvError::Config(_)));
    }

    #[test]
    fn point_rows_parse_with_defaults() {
        let csv = "\
id,kind,scalar_type,byte_order,scale,offset,unit,min,max,description,unit_id,function_code,address,bit_length
10001,telemetry,uint16,,0.1,,kW,,,active power,1,3,100,
10002,signal,bool,,,,,,,breaker state,1,2,50,
40001,setpoint,float32,CDAB,,,kW,0,500,power setpoint,1,16,200,32
";
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        f.write_all(csv.as_bytes()).unwrap();
        let rows = load_point_rows(f.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, 10001);
        assert_eq!(rows[0].scale, Some(0.1));
        assert_eq!(rows[0].offset, None);
        assert_eq!(rows[0].byte_order, None);
        assert_eq!(rows[2].byte_order.as_deref(), Some("CDAB"));
        assert_eq!(rows[2].bit_length, Some(32));
    }

    #[test]
    fn same_link_ignores_point_table() {
        let f = write_temp(SAMPLE_YAML);
        let cfg = AppConfig::load(f.path()).unwrap();
        let mut changed = cfg.channels[0].clone();
        changed.point_table = PathBuf::from("points/other.csv");
        assert!(cfg.channels[0].same_link(&changed));

        changed.poll_interval_ms += 1;
        assert!(!cfg.channels[0].same_link(&changed));
    }

    #[test]
    fn slave_role_rejected() {
        let f = write_temp(SAMPLE_YAML);
        let mut cfg = AppConfig::load(f.path()).unwrap();
        cfg.channels[0].role = ChannelRole::Slave;
        assert!(cfg.channels[0].validate().is_err());
    }
}
