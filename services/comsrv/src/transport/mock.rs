//! Scripted transport for driver and channel tests
//!
//! Each `send` consumes the next scripted reply; `recv_exact` then serves
//! those bytes. `Silence` models a mute device (receive deadline elapses),
//! `Disconnect` models a link drop mid-transaction.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::{Transport, TransportError};

/// Scripted reply to one request frame.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond with these bytes (may contain several frames back to back)
    Bytes(Vec<u8>),
    /// Synthesize a well-formed read response to the request just sent,
    /// echoing its unit id, function code and transaction id; the payload
    /// is the PDU after the function code (byte count + data)
    Respond(Vec<u8>),
    /// Synthesize a write acknowledgement echoing the request header
    AckWrite,
    /// No response at all
    Silence,
    /// Link drops when the response is awaited
    Disconnect,
}

impl MockReply {
    /// Read response carrying these registers.
    pub fn registers(registers: &[u16]) -> Self {
        let mut tail = Vec::with_capacity(1 + registers.len() * 2);
        tail.push((registers.len() * 2) as u8);
        for r in registers {
            tail.extend_from_slice(&r.to_be_bytes());
        }
        MockReply::Respond(tail)
    }

    /// Read response carrying these packed coil/discrete bytes.
    pub fn bits(packed: &[u8]) -> Self {
        let mut tail = Vec::with_capacity(1 + packed.len());
        tail.push(packed.len() as u8);
        tail.extend_from_slice(packed);
        MockReply::Respond(tail)
    }
}

#[derive(Debug, Default)]
struct Shared {
    script: Mutex<VecDeque<MockReply>>,
    /// Served when the script is empty
    default_reply: Mutex<Option<MockReply>>,
    sent: Mutex<Vec<Vec<u8>>>,
    connect_failures: AtomicU32,
    connects: AtomicU32,
}

/// Split a request frame into (tcp transaction, unit, pdu).
fn parse_request(data: &[u8]) -> Option<(Option<[u8; 2]>, u8, &[u8])> {
    if data.len() >= 8 && data[2] == 0 && data[3] == 0 {
        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length + 6 == data.len() {
            return Some((Some([data[0], data[1]]), data[6], &data[7..]));
        }
    }
    if data.len() >= 4 {
        // RTU: strip unit and trailing CRC.
        return Some((None, data[0], &data[1..data.len() - 2]));
    }
    None
}

/// Wrap a response PDU in the framing the request used.
fn frame_response(transaction: Option<[u8; 2]>, unit: u8, pdu: &[u8]) -> Vec<u8> {
    match transaction {
        Some(txn) => {
            let length = (pdu.len() + 1) as u16;
            let mut frame = Vec::with_capacity(7 + pdu.len());
            frame.extend_from_slice(&txn);
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&length.to_be_bytes());
            frame.push(unit);
            frame.extend_from_slice(pdu);
            frame
        },
        None => crate::protocol::modbus::frame::rtu_frame(unit, pdu),
    }
}

/// Test-side handle to a `MockTransport`.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockHandle {
    /// Queue a reply for the next unanswered request.
    pub fn push_reply(&self, reply: MockReply) {
        if let Ok(mut script) = self.shared.script.lock() {
            script.push_back(reply);
        }
    }

    /// Reply served whenever the script is empty.
    pub fn set_default_reply(&self, reply: MockReply) {
        if let Ok(mut default) = self.shared.default_reply.lock() {
            *default = Some(reply);
        }
    }

    /// All frames transmitted so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.shared.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    Silent,
    Dropping,
}

#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
    connected: bool,
    pending: VecDeque<u8>,
    mode: LineMode,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        Self::with_script(Vec::new())
    }

    pub fn with_script(script: Vec<MockReply>) -> (Self, MockHandle) {
        let shared = Arc::new(Shared {
            script: Mutex::new(script.into()),
            ..Shared::default()
        });
        let handle = MockHandle {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                connected: false,
                pending: VecDeque::new(),
                mode: LineMode::Silent,
            },
            handle,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        let failures = &self.shared.connect_failures;
        let mut remaining = failures.load(Ordering::SeqCst);
        while remaining > 0 {
            match failures.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(TransportError::ConnectFailed(
                        "scripted connect failure".to_string(),
                    ))
                },
                Err(current) => remaining = current,
            }
        }
        self.connected = true;
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Ok(mut sent) = self.shared.sent.lock() {
            sent.push(data.to_vec());
        }
        let reply = self
            .shared
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .or_else(|| {
                self.shared
                    .default_reply
                    .lock()
                    .ok()
                    .and_then(|d| d.clone())
            });
        match reply {
            Some(MockReply::Bytes(bytes)) => {
                self.pending.extend(bytes);
                self.mode = LineMode::Silent;
            },
            Some(MockReply::Respond(tail)) => {
                if let Some((transaction, unit, request_pdu)) = parse_request(data) {
                    let mut pdu = Vec::with_capacity(1 + tail.len());
                    pdu.push(request_pdu[0]);
                    pdu.extend_from_slice(&tail);
                    self.pending.extend(frame_response(transaction, unit, &pdu));
                }
                self.mode = LineMode::Silent;
            },
            Some(MockReply::AckWrite) => {
                if let Some((transaction, unit, request_pdu)) = parse_request(data) {
                    let take = request_pdu.len().min(5);
                    self.pending
                        .extend(frame_response(transaction, unit, &request_pdu[..take]));
                }
                self.mode = LineMode::Silent;
            },
            Some(MockReply::Silence) | None => {
                self.mode = LineMode::Silent;
            },
            Some(MockReply::Disconnect) => {
                self.mode = LineMode::Dropping;
            },
        }
        Ok(())
    }

    async fn recv_exact(
        &mut self,
        n: usize,
        _deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.pending.len() >= n {
            return Ok(self.pending.drain(..n).collect());
        }
        match self.mode {
            LineMode::Dropping => {
                self.connected = false;
                self.pending.clear();
                Err(TransportError::Io("scripted disconnect".to_string()))
            },
            // A mute line: report the deadline as elapsed without waiting
            // out real time, which keeps retry tests fast.
            LineMode::Silent => Err(TransportError::Timeout),
        }
    }

    async fn drain(&mut self, _idle: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}
