//! TCP transport implementation

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::{Transport, TransportError};

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for Modbus TCP and other stream protocols.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16) -> Result<Self, TransportError> {
        if host.is_empty() {
            return Err(TransportError::Config("host cannot be empty".to_string()));
        }
        if port == 0 {
            return Err(TransportError::Config("port cannot be zero".to_string()));
        }
        Ok(Self {
            host,
            port,
            stream: None,
        })
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectFailed(format!("{addr}: connect timeout")))?
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY on {addr}: {e}");
        }
        debug!("connected to {addr}");
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
                    return Err(TransportError::Io("connection closed by peer".to_string()));
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
                Err(_) => return Ok(()), // line idle
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(TransportError::Io("connection closed by peer".to_string()));
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
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn rejects_invalid_config() {
        assert!(TcpTransport::new(String::new(), 502).is_err());
        assert!(TcpTransport::new("localhost".to_string(), 0).is_err());
    }

    #[tokio::test]
    async fn connects_and_echoes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port()).unwrap();
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.send(&[1, 2, 3, 4]).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let echoed = transport.recv_exact(4, deadline).await.unwrap();
        assert_eq!(echoed, vec![1, 2, 3, 4]);

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn recv_times_out_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port()).unwrap();
        transport.connect().await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = transport.recv_exact(1, deadline).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn connect_refused_reports_connect_failed() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port()).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed(_)));
    }
}
