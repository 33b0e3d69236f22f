//! Protocol drivers
//!
//! A driver executes read/write transactions by composing a framer with a
//! transport. Drivers expose one uniform capability set and are selected by
//! a tagged enum, so channel code never depends on a concrete protocol.

use std::time::Duration;
use thiserror::Error;

use crate::config::{ChannelRole, ProtocolKind};
use crate::error::{ComSrvError, Result};
use crate::points::ReadGroup;
use crate::transport::{Transport, TransportError};

pub mod modbus;

pub use modbus::master::{ModbusFlavor, ModbusMaster};
pub use modbus::{ExceptionCode, FunctionCode};

/// Wire-level and transaction-level failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No (matching) response before the deadline
    #[error("no response within deadline")]
    Timeout,

    /// Frame checksum mismatch
    #[error("CRC mismatch: expected 0x{expected:04X}, found 0x{found:04X}")]
    Crc { expected: u16, found: u16 },

    /// Frame structure could not be interpreted
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Device returned an exception response
    #[error("device exception: {0}")]
    Exception(ExceptionCode),

    /// Response function code does not match the request
    #[error("unexpected function code: expected 0x{expected:02X}, found 0x{found:02X}")]
    UnexpectedFunction { expected: u8, found: u8 },

    /// Response unit id does not match the request
    #[error("unexpected unit id: expected {expected}, found {found}")]
    UnexpectedUnit { expected: u8, found: u8 },

    /// Requested operation is outside the driver's capability set
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl ProtocolError {
    /// Whether the request may be re-transmitted. Exceptions and broken
    /// links are never retried; timeouts and unusable frames are.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Timeout
            | ProtocolError::Crc { .. }
            | ProtocolError::Malformed(_)
            | ProtocolError::UnexpectedFunction { .. }
            | ProtocolError::UnexpectedUnit { .. } => true,
            ProtocolError::Transport(TransportError::Timeout) => true,
            ProtocolError::Transport(_)
            | ProtocolError::Exception(_)
            | ProtocolError::NotImplemented(_) => false,
        }
    }

    /// Whether the underlying link must be re-established.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(
                TransportError::Io(_)
                    | TransportError::NotConnected
                    | TransportError::ConnectFailed(_)
            )
        )
    }
}

/// Decoded read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPayload {
    Registers(Vec<u16>),
    Coils(Vec<bool>),
}

/// Value for a single-point write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteValue {
    Coil(bool),
    Register(u16),
}

/// Values for a multi-point write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValues {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
}

/// Per-link traffic counters, drained by the channel runtime after each
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub requests: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub last_response_time: Option<Duration>,
}

/// Tagged protocol driver. State lives in the variant value.
#[derive(Debug)]
pub enum Driver {
    Modbus(ModbusMaster),
}

impl Driver {
    pub async fn connect(&mut self) -> std::result::Result<(), TransportError> {
        match self {
            Driver::Modbus(m) => m.connect().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Driver::Modbus(m) => m.close().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Driver::Modbus(m) => m.is_connected(),
        }
    }

    /// Execute one batched read.
    pub async fn read(
        &mut self,
        group: &ReadGroup,
        timeout: Duration,
    ) -> std::result::Result<ReadPayload, ProtocolError> {
        match self {
            Driver::Modbus(m) => m.read(group, timeout).await,
        }
    }

    /// Write one coil or register.
    pub async fn write_single(
        &mut self,
        unit_id: u8,
        function_code: FunctionCode,
        address: u16,
        value: WriteValue,
        timeout: Duration,
    ) -> std::result::Result<(), ProtocolError> {
        match self {
            Driver::Modbus(m) => {
                m.write_single(unit_id, function_code, address, value, timeout)
                    .await
            },
        }
    }

    /// Write a span of coils or registers.
    pub async fn write_multiple(
        &mut self,
        unit_id: u8,
        function_code: FunctionCode,
        start: u16,
        values: &WriteValues,
        timeout: Duration,
    ) -> std::result::Result<(), ProtocolError> {
        match self {
            Driver::Modbus(m) => {
                m.write_multiple(unit_id, function_code, start, values, timeout)
                    .await
            },
        }
    }

    /// Drain accumulated traffic counters.
    pub fn take_stats(&mut self) -> LinkStats {
        match self {
            Driver::Modbus(m) => m.take_stats(),
        }
    }
}

/// Build a driver for a channel. Pure function of the channel parameters;
/// protocol state lives entirely in the returned value.
pub fn build_driver(
    protocol: ProtocolKind,
    role: ChannelRole,
    transport: Box<dyn Transport>,
    flavor: ModbusFlavor,
    retry_count: u32,
) -> Result<Driver> {
    match (protocol, role) {
        (ProtocolKind::Modbus, ChannelRole::Master) => Ok(Driver::Modbus(ModbusMaster::new(
            transport,
            flavor,
            retry_count,
        ))),
        (ProtocolKind::Modbus, ChannelRole::Slave) => Err(ComSrvError::NotImplemented(
            "modbus slave role".to_string(),
        )),
    }
}
