//! Transport layer
//!
//! Byte-level duplex I/O over serial lines and TCP sockets. Protocol code
//! talks to the `Transport` trait only; every channel owns its transport
//! exclusively, so implementations need no internal locking.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::TransportSpec;

pub mod mock;
pub mod serial;
pub mod tcp;

pub use mock::{MockHandle, MockReply, MockTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The link could not be established
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The link broke mid-operation
    #[error("io error: {0}")]
    Io(String),

    /// The receive deadline elapsed
    #[error("receive deadline elapsed")]
    Timeout,

    /// Operation attempted before `connect`
    #[error("not connected")]
    NotConnected,

    /// Invalid transport parameters
    #[error("transport config: {0}")]
    Config(String),
}

/// Byte-stream transport over one physical link.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Establish the link. Idempotent when already connected.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Write all bytes or fail.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes, failing with `Timeout` once `deadline` passes.
    async fn recv_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>, TransportError>;

    /// Read and discard pending bytes until the line has been idle for
    /// `idle`. Used to resynchronise after an unusable frame.
    async fn drain(&mut self, idle: Duration) -> Result<(), TransportError>;

    /// Release the link. Idempotent.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Transport kind identifier for logging
    fn kind(&self) -> &'static str;
}

/// Build a transport from its configuration record.
pub fn open_transport(spec: &TransportSpec) -> Result<Box<dyn Transport>, TransportError> {
    match spec {
        TransportSpec::Tcp { host, port } => {
            Ok(Box::new(TcpTransport::new(host.clone(), *port)?))
        },
        TransportSpec::Serial {
            port,
            baud,
            data_bits,
            stop_bits,
            parity,
        } => Ok(Box::new(SerialTransport::new(
            port.clone(),
            *baud,
            *data_bits,
            *stop_bits,
            *parity,
        )?)),
    }
}
