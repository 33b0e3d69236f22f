//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use comsrv::channel::{spawn_channel, ChannelHandle, ChannelRuntimeConfig};
use comsrv::points::{ByteOrder, ModbusAddress, Point, PointKind, PointModel, ScalarType};
use comsrv::protocol::{Driver, FunctionCode, ModbusFlavor, ModbusMaster};
use comsrv::publisher::{Publisher, PublisherConfig, PublisherTask};
use comsrv::transport::{MockHandle, MockTransport};
use comsrv_rtdb::MemoryRtdb;

pub const CHANNEL_ID: u16 = 1001;

pub fn telemetry_point(id: u32, address: u16, scale: f64) -> Point {
    Point {
        id,
        kind: PointKind::Telemetry,
        scalar: ScalarType::Uint16,
        byte_order: ByteOrder::Abcd,
        scale,
        offset: 0.0,
        unit: None,
        range: None,
        description: String::new(),
        address: ModbusAddress {
            unit_id: 1,
            function_code: FunctionCode::ReadHoldingRegisters,
            address,
            bit_length: 16,
        },
    }
}

pub fn signal_point(id: u32, address: u16) -> Point {
    Point {
        id,
        kind: PointKind::Signal,
        scalar: ScalarType::Bool,
        byte_order: ByteOrder::Abcd,
        scale: 1.0,
        offset: 0.0,
        unit: None,
        range: None,
        description: String::new(),
        address: ModbusAddress {
            unit_id: 1,
            function_code: FunctionCode::ReadDiscreteInputs,
            address,
            bit_length: 1,
        },
    }
}

pub fn float_setpoint(id: u32, address: u16, byte_order: ByteOrder) -> Point {
    Point {
        id,
        kind: PointKind::Setpoint,
        scalar: ScalarType::Float32,
        byte_order,
        scale: 1.0,
        offset: 0.0,
        unit: None,
        range: None,
        description: String::new(),
        address: ModbusAddress {
            unit_id: 1,
            function_code: FunctionCode::WriteMultipleRegisters,
            address,
            bit_length: 32,
        },
    }
}

pub fn control_point(id: u32, address: u16) -> Point {
    Point {
        id,
        kind: PointKind::Control,
        scalar: ScalarType::Bool,
        byte_order: ByteOrder::Abcd,
        scale: 1.0,
        offset: 0.0,
        unit: None,
        range: None,
        description: String::new(),
        address: ModbusAddress {
            unit_id: 1,
            function_code: FunctionCode::WriteSingleCoil,
            address,
            bit_length: 1,
        },
    }
}

pub fn model_of(points: Vec<Point>) -> PointModel {
    let mut model = PointModel::new(0);
    for point in points {
        model.upsert(point).expect("test point must be valid");
    }
    model
}

/// A channel runtime wired to a scripted transport and an in-memory store.
pub struct TestChannel {
    pub handle: ChannelHandle,
    pub mock: MockHandle,
    pub rtdb: Arc<MemoryRtdb>,
    pub publisher: Publisher,
    pub publisher_task: PublisherTask,
}

pub struct TestChannelOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub retry_count: u32,
    pub command_queue_depth: usize,
    /// Device script installed before the channel task starts
    pub script: Vec<comsrv::transport::MockReply>,
    /// Reply served once the script is exhausted
    pub default_reply: Option<comsrv::transport::MockReply>,
    /// Connect attempts that fail before the first success
    pub fail_connects: u32,
}

impl Default for TestChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(30),
            timeout: Duration::from_millis(100),
            retry_count: 3,
            command_queue_depth: 64,
            script: Vec::new(),
            default_reply: None,
            fail_connects: 0,
        }
    }
}

pub fn start_channel(points: Vec<Point>, options: TestChannelOptions) -> TestChannel {
    let rtdb = Arc::new(MemoryRtdb::new());
    let publisher_config = PublisherConfig {
        max_wait: Duration::from_millis(5),
        ..PublisherConfig::default()
    };
    let (publisher, publisher_task) = Publisher::spawn(rtdb.clone(), publisher_config);

    let (transport, mock) = MockTransport::with_script(options.script.clone());
    if let Some(default_reply) = options.default_reply.clone() {
        mock.set_default_reply(default_reply);
    }
    if options.fail_connects > 0 {
        mock.fail_next_connects(options.fail_connects);
    }
    let master = ModbusMaster::new(Box::new(transport), ModbusFlavor::Tcp, options.retry_count);
    let driver = Driver::Modbus(master);

    let cfg = ChannelRuntimeConfig {
        channel_id: CHANNEL_ID,
        name: "test-channel".to_string(),
        poll_interval: options.poll_interval,
        timeout: options.timeout,
        failure_threshold: 5,
        command_queue_depth: options.command_queue_depth,
    };
    let handle = spawn_channel(cfg, model_of(points), driver, publisher.clone());

    TestChannel {
        handle,
        mock,
        rtdb,
        publisher,
        publisher_task,
    }
}

impl TestChannel {
    pub async fn stop(self) {
        self.handle.stop(Duration::from_secs(2)).await;
        let _ = self.publisher.flush().await;
        drop(self.publisher);
        self.publisher_task.join().await;
    }
}

/// Poll `predicate` until it holds or the timeout elapses.
pub async fn wait_for<F>(what: &str, timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Minimal Modbus TCP device: answers reads from a fixed register image
/// and acknowledges writes. Good enough to exercise the supervisor with
/// real TCP transports.
pub async fn spawn_modbus_server(register_image: Vec<u16>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let image = register_image.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 7];
                    if socket.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                    let mut pdu = vec![0u8; length.saturating_sub(1)];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        return;
                    }
                    let response = match pdu.first() {
                        Some(0x03) | Some(0x04) => {
                            let start = usize::from(u16::from_be_bytes([pdu[1], pdu[2]]));
                            let count = usize::from(u16::from_be_bytes([pdu[3], pdu[4]]));
                            let mut body = vec![pdu[0], (count * 2) as u8];
                            for i in 0..count {
                                let value = image.get(start + i).copied().unwrap_or(0);
                                body.extend_from_slice(&value.to_be_bytes());
                            }
                            body
                        },
                        // Writes: echo the request header back.
                        Some(0x05) | Some(0x06) | Some(0x0F) | Some(0x10) => {
                            pdu[..5.min(pdu.len())].to_vec()
                        },
                        _ => vec![pdu.first().copied().unwrap_or(0) | 0x80, 0x01],
                    };
                    let mut frame = Vec::with_capacity(7 + response.len());
                    frame.extend_from_slice(&header[0..4]);
                    frame.extend_from_slice(&((response.len() as u16) + 1).to_be_bytes());
                    frame.push(header[6]);
                    frame.extend_from_slice(&response);
                    if socket.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}
