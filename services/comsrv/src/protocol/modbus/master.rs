//! Modbus master state machine
//!
//! Executes read/write transactions over a transport, enforcing
//! request/response correlation, retries and timeouts. Retries apply to
//! timeouts and unusable frames only; device exceptions are surfaced
//! immediately. On RTU a retransmission always waits out one inter-frame
//! silence, and an unusable frame drains the line before the next attempt.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::super::{LinkStats, ProtocolError, ReadPayload, WriteValue, WriteValues};
use super::frame::{self, MbapHeader, MBAP_LEN};
use super::pdu;
use super::FunctionCode;
use crate::points::ReadGroup;
use crate::transport::{Transport, TransportError};

/// Idle interval used to resynchronise a TCP stream after garbage.
const TCP_RESYNC_IDLE: Duration = Duration::from_millis(10);

/// Framing selected by the channel's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusFlavor {
    Tcp,
    Rtu {
        /// End-of-frame silence (3.5 character times, floored)
        silence: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
enum ResponseKind {
    Registers(u16),
    Bits(u16),
    Ack,
}

#[derive(Debug)]
enum Response {
    Registers(Vec<u16>),
    Coils(Vec<bool>),
    Ack,
}

/// Master-side Modbus driver for one channel.
#[derive(Debug)]
pub struct ModbusMaster {
    transport: Box<dyn Transport>,
    flavor: ModbusFlavor,
    retry_count: u32,
    next_transaction: u16,
    stats: LinkStats,
}

impl ModbusMaster {
    pub fn new(transport: Box<dyn Transport>, flavor: ModbusFlavor, retry_count: u32) -> Self {
        Self {
            transport,
            flavor,
            retry_count,
            next_transaction: 0,
            stats: LinkStats::default(),
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn take_stats(&mut self) -> LinkStats {
        std::mem::take(&mut self.stats)
    }

    fn alloc_transaction(&mut self) -> u16 {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        id
    }

    /// Execute one batched read.
    pub async fn read(
        &mut self,
        group: &ReadGroup,
        timeout: Duration,
    ) -> Result<ReadPayload, ProtocolError> {
        let fc = group.function_code;
        if !fc.is_read() {
            return Err(ProtocolError::NotImplemented(format!(
                "read with function code 0x{:02X}",
                u8::from(fc)
            )));
        }
        if group.count == 0 || group.count > fc.max_span() {
            return Err(ProtocolError::Malformed(format!(
                "read span {} out of bounds for function 0x{:02X}",
                group.count,
                u8::from(fc)
            )));
        }
        let request = pdu::read_request(fc, group.start, group.count);
        let kind = if fc.is_bit_addressed() {
            ResponseKind::Bits(group.count)
        } else {
            ResponseKind::Registers(group.count)
        };
        match self.transact(group.unit_id, fc, &request, kind, timeout).await? {
            Response::Registers(registers) => Ok(ReadPayload::Registers(registers)),
            Response::Coils(bits) => Ok(ReadPayload::Coils(bits)),
            Response::Ack => Err(ProtocolError::Malformed(
                "write acknowledgement to a read request".to_string(),
            )),
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
    ) -> Result<(), ProtocolError> {
        let raw = match (function_code, value) {
            (FunctionCode::WriteSingleCoil, WriteValue::Coil(on)) => pdu::coil_value(on),
            (FunctionCode::WriteSingleRegister, WriteValue::Register(v)) => v,
            _ => {
                return Err(ProtocolError::NotImplemented(format!(
                    "single write with function code 0x{:02X}",
                    u8::from(function_code)
                )))
            },
        };
        let request = pdu::write_single_request(function_code, address, raw);
        self.transact(unit_id, function_code, &request, ResponseKind::Ack, timeout)
            .await?;
        Ok(())
    }

    /// Write a span of coils or registers.
    pub async fn write_multiple(
        &mut self,
        unit_id: u8,
        function_code: FunctionCode,
        start: u16,
        values: &WriteValues,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let request = match (function_code, values) {
            (FunctionCode::WriteMultipleRegisters, WriteValues::Registers(registers)) => {
                if registers.is_empty() || registers.len() > usize::from(super::MAX_WRITE_REGISTERS)
                {
                    return Err(ProtocolError::Malformed(format!(
                        "register write span {} out of bounds",
                        registers.len()
                    )));
                }
                pdu::write_multiple_registers_request(start, registers)
            },
            (FunctionCode::WriteMultipleCoils, WriteValues::Coils(bits)) => {
                if bits.is_empty() || bits.len() > usize::from(super::MAX_WRITE_BITS) {
                    return Err(ProtocolError::Malformed(format!(
                        "coil write span {} out of bounds",
                        bits.len()
                    )));
                }
                pdu::write_multiple_coils_request(start, bits)
            },
            _ => {
                return Err(ProtocolError::NotImplemented(format!(
                    "multiple write with function code 0x{:02X}",
                    u8::from(function_code)
                )))
            },
        };
        self.transact(unit_id, function_code, &request, ResponseKind::Ack, timeout)
            .await?;
        Ok(())
    }

    /// Request/response cycle with retry handling.
    async fn transact(
        &mut self,
        unit_id: u8,
        expected: FunctionCode,
        request: &[u8],
        kind: ResponseKind,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let mut last_error = None;
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                if let ModbusFlavor::Rtu { silence } = self.flavor {
                    tokio::time::sleep(silence).await;
                }
                debug!(
                    unit_id,
                    function = u8::from(expected),
                    attempt,
                    "retransmitting request"
                );
            }
            match self.attempt(unit_id, expected, request, kind, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    if !matches!(e, ProtocolError::Timeout) {
                        // Unusable frame: clear whatever is left on the line
                        // before retransmitting.
                        let idle = match self.flavor {
                            ModbusFlavor::Rtu { silence } => silence,
                            ModbusFlavor::Tcp => TCP_RESYNC_IDLE,
                        };
                        let _ = self.transport.drain(idle).await;
                    }
                    trace!(unit_id, "attempt {attempt} failed: {e}");
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(ProtocolError::Timeout))
    }

    async fn attempt(
        &mut self,
        unit_id: u8,
        expected: FunctionCode,
        request: &[u8],
        kind: ResponseKind,
        timeout: Duration,
    ) -> Result<Response, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let (frame, transaction) = match self.flavor {
            ModbusFlavor::Tcp => {
                let txn = self.alloc_transaction();
                (frame::tcp_frame(txn, unit_id, request), txn)
            },
            ModbusFlavor::Rtu { .. } => (frame::rtu_frame(unit_id, request), 0),
        };
        self.transport.send(&frame).await?;
        self.stats.requests += 1;
        self.stats.bytes_tx += frame.len() as u64;

        let started = Instant::now();
        let response = match self.flavor {
            ModbusFlavor::Tcp => {
                self.recv_tcp(transaction, unit_id, expected, kind, deadline)
                    .await?
            },
            ModbusFlavor::Rtu { .. } => self.recv_rtu(unit_id, expected, kind, deadline).await?,
        };
        self.stats.last_response_time = Some(started.elapsed());
        Ok(response)
    }

    async fn recv_exact(
        &mut self,
        n: usize,
        deadline: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        match self.transport.recv_exact(n, deadline).await {
            Ok(bytes) => Ok(bytes),
            Err(TransportError::Timeout) => Err(ProtocolError::Timeout),
            Err(e) => Err(ProtocolError::Transport(e)),
        }
    }

    async fn recv_tcp(
        &mut self,
        transaction: u16,
        unit_id: u8,
        expected: FunctionCode,
        kind: ResponseKind,
        deadline: Instant,
    ) -> Result<Response, ProtocolError> {
        loop {
            let header_bytes = self.recv_exact(MBAP_LEN, deadline).await?;
            let header = MbapHeader::parse(&header_bytes)?;
            let body = self.recv_exact(header.pdu_len(), deadline).await?;
            self.stats.bytes_rx += (MBAP_LEN + body.len()) as u64;

            if header.transaction_id != transaction {
                // Late response to an earlier request: discard and keep
                // listening until the deadline.
                debug!(
                    expected = transaction,
                    found = header.transaction_id,
                    "discarding response with unexpected transaction id"
                );
                continue;
            }
            if header.unit_id != unit_id {
                return Err(ProtocolError::UnexpectedUnit {
                    expected: unit_id,
                    found: header.unit_id,
                });
            }
            return parse_response(expected, &body, kind);
        }
    }

    async fn recv_rtu(
        &mut self,
        unit_id: u8,
        expected: FunctionCode,
        kind: ResponseKind,
        deadline: Instant,
    ) -> Result<Response, ProtocolError> {
        // [unit][fc] first, then the length is known from the function.
        let mut raw = self.recv_exact(2, deadline).await?;
        let fc_byte = raw[1];
        if fc_byte & 0x80 != 0 {
            // Exception: one code byte plus CRC.
            raw.extend(self.recv_exact(3, deadline).await?);
        } else if matches!(kind, ResponseKind::Ack) {
            // Echo of address and value/quantity plus CRC.
            raw.extend(self.recv_exact(6, deadline).await?);
        } else {
            let byte_count = self.recv_exact(1, deadline).await?;
            raw.extend(&byte_count);
            raw.extend(
                self.recv_exact(usize::from(byte_count[0]) + 2, deadline)
                    .await?,
            );
        }
        self.stats.bytes_rx += raw.len() as u64;

        frame::verify_rtu_crc(&raw)?;
        if raw[0] != unit_id {
            return Err(ProtocolError::UnexpectedUnit {
                expected: unit_id,
                found: raw[0],
            });
        }
        parse_response(expected, &raw[1..raw.len() - 2], kind)
    }
}

fn parse_response(
    expected: FunctionCode,
    body: &[u8],
    kind: ResponseKind,
) -> Result<Response, ProtocolError> {
    match kind {
        ResponseKind::Registers(count) => Ok(Response::Registers(pdu::parse_register_response(
            expected, body, count,
        )?)),
        ResponseKind::Bits(count) => Ok(Response::Coils(pdu::parse_bit_response(
            expected, body, count,
        )?)),
        ResponseKind::Ack => {
            pdu::parse_write_ack(expected, body)?;
            Ok(Response::Ack)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockReply, MockTransport};
    use tracing_test::traced_test;

    fn read_group(fc: FunctionCode, start: u16, count: u16) -> ReadGroup {
        ReadGroup {
            unit_id: 1,
            function_code: fc,
            start,
            count,
            point_ids: Vec::new(),
        }
    }

    fn tcp_response(txn: u16, unit: u8, body: &[u8]) -> Vec<u8> {
        frame::tcp_frame(txn, unit, body)
    }

    async fn connected_master(replies: Vec<MockReply>, flavor: ModbusFlavor, retries: u32) -> (ModbusMaster, crate::transport::MockHandle) {
        let (transport, handle) = MockTransport::with_script(replies);
        let mut master = ModbusMaster::new(Box::new(transport), flavor, retries);
        master.connect().await.unwrap();
        (master, handle)
    }

    #[tokio::test]
    async fn tcp_read_holding_registers() {
        let response = tcp_response(0, 1, &[0x03, 0x02, 0x00, 0x19]);
        let (mut master, handle) =
            connected_master(vec![MockReply::Bytes(response)], ModbusFlavor::Tcp, 3).await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 100, 1);
        let payload = master.read(&group, Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload, ReadPayload::Registers(vec![0x0019]));

        // Request frame: MBAP txn 0 + read PDU for address 100, count 1.
        let sent = handle.sent();
        assert_eq!(
            sent[0],
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01]
        );

        let stats = master.take_stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_tx, 12);
        assert_eq!(stats.bytes_rx, 11);
        assert!(stats.last_response_time.is_some());
    }

    #[tokio::test]
    async fn tcp_transaction_ids_increment() {
        let r0 = tcp_response(0, 1, &[0x03, 0x02, 0x00, 0x01]);
        let r1 = tcp_response(1, 1, &[0x03, 0x02, 0x00, 0x02]);
        let (mut master, _handle) = connected_master(
            vec![MockReply::Bytes(r0), MockReply::Bytes(r1)],
            ModbusFlavor::Tcp,
            0,
        )
        .await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 0, 1);
        let first = master.read(&group, Duration::from_millis(100)).await.unwrap();
        let second = master.read(&group, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, ReadPayload::Registers(vec![1]));
        assert_eq!(second, ReadPayload::Registers(vec![2]));
    }

    #[tokio::test]
    async fn tcp_mismatched_transaction_discarded() {
        // A stale response (txn 0xBEEF) arrives before the matching one.
        let stale = tcp_response(0xBEEF, 1, &[0x03, 0x02, 0x00, 0x63]);
        let good = tcp_response(0, 1, &[0x03, 0x02, 0x00, 0x19]);
        let both = [stale, good].concat();
        let (mut master, _handle) =
            connected_master(vec![MockReply::Bytes(both)], ModbusFlavor::Tcp, 0).await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 100, 1);
        let payload = master.read(&group, Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload, ReadPayload::Registers(vec![0x0019]));
    }

    #[tokio::test]
    #[traced_test]
    async fn silent_device_exhausts_retries() {
        let (mut master, handle) = connected_master(
            vec![MockReply::Silence, MockReply::Silence, MockReply::Silence],
            ModbusFlavor::Tcp,
            2,
        )
        .await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 0, 1);
        let err = master.read(&group, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        // One original transmission plus exactly two retries, each one
        // logged before it goes out.
        assert_eq!(handle.sent_count(), 3);
        assert_eq!(master.take_stats().requests, 3);
        assert!(logs_contain("retransmitting request"));
    }

    #[tokio::test]
    async fn exception_is_not_retried() {
        let response = tcp_response(0, 1, &[0x83, 0x02]);
        let (mut master, handle) =
            connected_master(vec![MockReply::Bytes(response)], ModbusFlavor::Tcp, 3).await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 0, 1);
        let err = master.read(&group, Duration::from_millis(50)).await.unwrap_err();
        match err {
            ProtocolError::Exception(code) => assert_eq!(code.0, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(handle.sent_count(), 1);
    }

    #[tokio::test]
    async fn io_error_is_not_retried() {
        let (mut master, handle) =
            connected_master(vec![MockReply::Disconnect], ModbusFlavor::Tcp, 3).await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 0, 1);
        let err = master.read(&group, Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_link_failure());
        assert_eq!(handle.sent_count(), 1);
        assert!(!master.is_connected());
    }

    #[tokio::test]
    async fn rtu_read_and_crc_retry() {
        // First reply carries a corrupted CRC, second is clean.
        let good = frame::rtu_frame(1, &[0x03, 0x02, 0x00, 0x19]);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let flavor = ModbusFlavor::Rtu {
            silence: Duration::from_millis(1),
        };
        let (mut master, handle) = connected_master(
            vec![MockReply::Bytes(bad), MockReply::Bytes(good)],
            flavor,
            1,
        )
        .await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 100, 1);
        let payload = master.read(&group, Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload, ReadPayload::Registers(vec![0x0019]));
        assert_eq!(handle.sent_count(), 2);
    }

    #[tokio::test]
    async fn rtu_exception_frame() {
        let exception = frame::rtu_frame(1, &[0x83, 0x04]);
        let flavor = ModbusFlavor::Rtu {
            silence: Duration::from_millis(1),
        };
        let (mut master, _handle) =
            connected_master(vec![MockReply::Bytes(exception)], flavor, 3).await;

        let group = read_group(FunctionCode::ReadHoldingRegisters, 0, 1);
        let err = master.read(&group, Duration::from_millis(50)).await.unwrap_err();
        match err {
            ProtocolError::Exception(code) => assert_eq!(code.0, 4),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_single_register_ack() {
        let ack = tcp_response(0, 1, &[0x06, 0x00, 0xC8, 0x00, 0x19]);
        let (mut master, handle) =
            connected_master(vec![MockReply::Bytes(ack)], ModbusFlavor::Tcp, 0).await;

        master
            .write_single(
                1,
                FunctionCode::WriteSingleRegister,
                200,
                WriteValue::Register(25),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(
            handle.sent()[0],
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0xC8, 0x00, 0x19]
        );
    }

    #[tokio::test]
    async fn write_multiple_registers_frame_layout() {
        let ack = tcp_response(0, 1, &[0x10, 0x00, 0xC8, 0x00, 0x02]);
        let (mut master, handle) =
            connected_master(vec![MockReply::Bytes(ack)], ModbusFlavor::Tcp, 0).await;

        master
            .write_multiple(
                1,
                FunctionCode::WriteMultipleRegisters,
                0x00C8,
                &WriteValues::Registers(vec![0xF5C3, 0x4048]),
                Duration::from_millis(100),
            )
            .await
            .unwrap();

        // MBAP length covers unit id + 10-byte PDU.
        assert_eq!(
            handle.sent()[0],
            vec![
                0x00, 0x00, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0xC8, 0x00, 0x02, 0x04,
                0xF5, 0xC3, 0x40, 0x48
            ]
        );
    }

    #[tokio::test]
    async fn coil_write_encodes_ff00() {
        let ack = tcp_response(0, 1, &[0x05, 0x00, 0x32, 0xFF, 0x00]);
        let (mut master, handle) =
            connected_master(vec![MockReply::Bytes(ack)], ModbusFlavor::Tcp, 0).await;

        master
            .write_single(
                1,
                FunctionCode::WriteSingleCoil,
                50,
                WriteValue::Coil(true),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        let sent = handle.sent();
        assert_eq!(&sent[0][7..], &[0x05, 0x00, 0x32, 0xFF, 0x00]);
    }

    #[tokio::test]
    async fn write_with_mismatched_values_rejected() {
        let (mut master, _handle) = connected_master(vec![], ModbusFlavor::Tcp, 0).await;
        let err = master
            .write_single(
                1,
                FunctionCode::WriteSingleCoil,
                0,
                WriteValue::Register(1),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotImplemented(_)));
    }
}
