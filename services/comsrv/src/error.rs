//! Error handling for the communication server
//!
//! One service-level error enum carries the full failure taxonomy; the
//! transport and protocol layers have their own narrower enums which
//! convert upward via `From`.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Service-level error type.
#[derive(Error, Debug)]
pub enum ComSrvError {
    /// Configuration could not be parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport could not establish the link
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Link broken mid-operation
    #[error("IO error: {0}")]
    Io(String),

    /// No response within the deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Frame failed CRC validation
    #[error("CRC error: {0}")]
    Crc(String),

    /// Frame could not be interpreted
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Device reported a protocol exception
    #[error("Protocol exception code {0}")]
    Exception(u8),

    /// Command queue full
    #[error("Channel busy: command queue full")]
    Busy,

    /// Operation aborted by stop/shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Unsupported point kind / function-code combination
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Channel id is not known to the supervisor
    #[error("Channel not found: {0}")]
    ChannelNotFound(u16),

    /// Point id is not present in the channel's point model
    #[error("Point not found: {0}")]
    PointNotFound(String),

    /// Realtime-store access failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Anything that should not happen
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ComSrvError>;

impl From<TransportError> for ComSrvError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectFailed(msg) => ComSrvError::ConnectFailed(msg),
            TransportError::Timeout => ComSrvError::Timeout("transport receive".to_string()),
            TransportError::NotConnected => ComSrvError::Io("not connected".to_string()),
            TransportError::Io(msg) => ComSrvError::Io(msg),
            TransportError::Config(msg) => ComSrvError::Config(msg),
        }
    }
}

impl From<ProtocolError> for ComSrvError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(t) => t.into(),
            ProtocolError::Timeout => ComSrvError::Timeout("no response".to_string()),
            ProtocolError::Crc { expected, found } => ComSrvError::Crc(format!(
                "expected 0x{expected:04X}, found 0x{found:04X}"
            )),
            ProtocolError::Malformed(msg) => ComSrvError::Malformed(msg),
            ProtocolError::Exception(code) => ComSrvError::Exception(code.into()),
            ProtocolError::UnexpectedFunction { expected, found } => ComSrvError::Malformed(
                format!("unexpected function: expected 0x{expected:02X}, found 0x{found:02X}"),
            ),
            ProtocolError::UnexpectedUnit { expected, found } => ComSrvError::Malformed(format!(
                "unexpected unit id: expected {expected}, found {found}"
            )),
            ProtocolError::NotImplemented(msg) => ComSrvError::NotImplemented(msg),
        }
    }
}

impl From<comsrv_rtdb::RtdbError> for ComSrvError {
    fn from(err: comsrv_rtdb::RtdbError) -> Self {
        ComSrvError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ComSrvError {
    fn from(err: std::io::Error) -> Self {
        ComSrvError::Io(err.to_string())
    }
}

impl From<figment::Error> for ComSrvError {
    fn from(err: figment::Error) -> Self {
        ComSrvError::Config(err.to_string())
    }
}

impl From<csv::Error> for ComSrvError {
    fn from(err: csv::Error) -> Self {
        ComSrvError::Config(format!("point table: {err}"))
    }
}

impl From<serde_json::Error> for ComSrvError {
    fn from(err: serde_json::Error) -> Self {
        ComSrvError::Internal(format!("JSON: {err}"))
    }
}

impl ComSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        ComSrvError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ComSrvError::Internal(msg.into())
    }

    /// Short tag used for the metrics error classification.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ComSrvError::Config(_) => "CONFIG_ERROR",
            ComSrvError::ConnectFailed(_) => "CONNECT_FAILED",
            ComSrvError::Io(_) => "IO_ERROR",
            ComSrvError::Timeout(_) => "TIMEOUT",
            ComSrvError::Crc(_) => "CRC_ERROR",
            ComSrvError::Malformed(_) => "MALFORMED",
            ComSrvError::Exception(_) => "PROTOCOL_EXCEPTION",
            ComSrvError::Busy => "BUSY",
            ComSrvError::Cancelled => "CANCELLED",
            ComSrvError::NotImplemented(_) => "NOT_IMPLEMENTED",
            ComSrvError::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            ComSrvError::PointNotFound(_) => "POINT_NOT_FOUND",
            ComSrvError::Storage(_) => "STORAGE_ERROR",
            ComSrvError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
