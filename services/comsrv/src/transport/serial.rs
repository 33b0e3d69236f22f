//! Serial transport implementation
//!
//! Wraps a `tokio_serial::SerialStream`. RTU timing constants (character
//! time, inter-frame silence) are derived from the line parameters here so
//! the protocol layer never needs to know the baud rate.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::{Transport, TransportError};
use crate::config::Parity;

/// Floor for the RTU inter-frame silence at high baud rates.
const SILENCE_FLOOR: Duration = Duration::from_micros(3500);

/// Wire time of one character: start bit + data + parity + stop bits.
pub fn char_time(baud: u32, data_bits: u8, stop_bits: u8, parity: Parity) -> Duration {
    let parity_bits = if parity == Parity::None { 0 } else { 1 };
    let bits = 1 + u32::from(data_bits) + parity_bits + u32::from(stop_bits);
    Duration::from_secs_f64(f64::from(bits) / f64::from(baud.max(1)))
}

/// RTU end-of-frame silence: 3.5 character times with a 3.5 ms floor.
pub fn frame_silence(baud: u32, data_bits: u8, stop_bits: u8, parity: Parity) -> Duration {
    char_time(baud, data_bits, stop_bits, parity)
        .mul_f64(3.5)
        .max(SILENCE_FLOOR)
}

/// Serial line transport for Modbus RTU.
#[derive(Debug)]
pub struct SerialTransport {
    port: String,
    baud: u32,
    data_bits: u8,
    stop_bits: u8,
    parity: Parity,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(
        port: String,
        baud: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: Parity,
    ) -> Result<Self, TransportError> {
        if port.is_empty() {
            return Err(TransportError::Config("port path cannot be empty".to_string()));
        }
        if baud == 0 {
            return Err(TransportError::Config("baud rate cannot be zero".to_string()));
        }
        if !(5..=8).contains(&data_bits) {
            return Err(TransportError::Config(format!(
                "data bits must be 5..=8, got {data_bits}"
            )));
        }
        if !(1..=2).contains(&stop_bits) {
            return Err(TransportError::Config(format!(
                "stop bits must be 1 or 2, got {stop_bits}"
            )));
        }
        Ok(Self {
            port,
            baud,
            data_bits,
            stop_bits,
            parity,
            stream: None,
        })
    }

    pub fn char_time(&self) -> Duration {
        char_time(self.baud, self.data_bits, self.stop_bits, self.parity)
    }

    pub fn frame_silence(&self) -> Duration {
        frame_silence(self.baud, self.data_bits, self.stop_bits, self.parity)
    }

    fn stream_mut(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let stream = tokio_serial::new(&self.port, self.baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.port)))?;
        debug!("opened serial port {} at {} baud", self.port, self.baud);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        match stream.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream = None;
                Err(TransportError::Io(e.to_string()))
            },
        }
    }

    async fn recv_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut()?;
        let mut buf = vec![0u8; n];
        let mut filled = 0usize;
        while filled < n {
            let read = match timeout_at(deadline, stream.read(&mut buf[filled..])).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(TransportError::Io(e.to_string()));
                },
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(TransportError::Io("serial port closed".to_string()));
                },
                Ok(Ok(read)) => read,
            };
            filled += read;
        }
        Ok(buf)
    }

    async fn drain(&mut self, idle: Duration) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        let mut scratch = [0u8; 256];
        loop {
            match timeout(idle, stream.read(&mut scratch)).await {
                Err(_) => return Ok(()),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(TransportError::Io("serial port closed".to_string()));
                },
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(TransportError::Io(e.to_string()));
                },
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn kind(&self) -> &'static str {
        "serial"
    }
}
