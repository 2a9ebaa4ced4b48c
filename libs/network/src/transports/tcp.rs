//! TCP Transport Implementation
//!
//! Length-prefixed framing over TCP: every frame is a 4-byte big-endian length
//! followed by the payload. Read and write halves are owned separately so a
//! connection's reader task never contends with its writer task.

use super::{Acceptor, Connection, Connector, FrameSink, FrameSource};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum frame size accepted or sent
    pub max_message_size: usize,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

/// Write half of a TCP connection with a reusable frame buffer
pub struct TcpFrameSink {
    write: OwnedWriteHalf,
    peer_addr: SocketAddr,
    max_message_size: usize,
    write_buffer: BytesMut,
    bytes_sent: u64,
}

/// Read half of a TCP connection
pub struct TcpFrameSource {
    read: OwnedReadHalf,
    peer_addr: SocketAddr,
    max_message_size: usize,
    read_buffer: BytesMut,
    bytes_received: u64,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_message_size {
            return Err(TransportError::protocol(format!(
                "Message size {} exceeds maximum {}",
                frame.len(),
                self.max_message_size
            )));
        }

        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        self.write_buffer.extend_from_slice(frame);

        // Single write call per frame
        self.write
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to write message", e))?;
        self.write
            .flush()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to flush TCP stream", e))?;

        self.bytes_sent += 4 + frame.len() as u64;
        debug!(
            peer = %self.peer_addr,
            bytes = frame.len(),
            total_sent = self.bytes_sent,
            "Sent frame over TCP"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.write.shutdown().await {
            warn!("Error shutting down TCP connection to {}: {}", self.peer_addr, e);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        let mut len_bytes = [0u8; 4];
        match self.read.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            // Clean close between frames
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(TransportError::network_with_source(
                    "Failed to read message length",
                    e,
                ))
            }
        }

        let message_len = u32::from_be_bytes(len_bytes) as usize;
        if message_len > self.max_message_size {
            return Err(TransportError::protocol(format!(
                "Message size {} exceeds maximum {}",
                message_len, self.max_message_size
            )));
        }

        self.read_buffer.resize(message_len, 0);
        match self.read.read_exact(&mut self.read_buffer).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TransportError::network(format!(
                    "Connection closed inside a {} byte frame",
                    message_len
                )))
            }
            Err(e) => {
                return Err(TransportError::network_with_source(
                    "Failed to read message data",
                    e,
                ))
            }
        }

        self.bytes_received += 4 + message_len as u64;
        debug!(
            peer = %self.peer_addr,
            bytes = message_len,
            total_received = self.bytes_received,
            "Received frame over TCP"
        );

        Ok(Some(self.read_buffer.split_to(message_len).freeze()))
    }
}

/// Wrap an established stream as a framed [`Connection`]
pub fn from_stream(stream: TcpStream, peer_addr: SocketAddr, config: &TcpConfig) -> Connection {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }
    let (read, write) = stream.into_split();
    let sink = TcpFrameSink {
        write,
        peer_addr,
        max_message_size: config.max_message_size,
        write_buffer: BytesMut::with_capacity(64 * 1024),
        bytes_sent: 0,
    };
    let source = TcpFrameSource {
        read,
        peer_addr,
        max_message_size: config.max_message_size,
        read_buffer: BytesMut::with_capacity(64 * 1024),
        bytes_received: 0,
    };
    Connection::new(peer_addr.to_string(), Box::new(sink), Box::new(source))
}

/// Listening TCP endpoint
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TcpConfig,
}

impl TcpAcceptor {
    /// Bind a listener; failure here is fatal for a root node
    pub async fn bind(bind_addr: SocketAddr, config: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to bind TCP listener", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("Failed to get local address", e))?;

        info!("TCP server listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to accept TCP connection", e))?;

        info!("Accepted TCP connection from {}", peer_addr);
        Ok(from_stream(stream, peer_addr, &self.config))
    }

    fn local_label(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Outbound TCP connector
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        let remote_addr: SocketAddr = address.parse().map_err(|_| {
            TransportError::configuration(format!("Invalid socket address '{}'", address), Some("address"))
        })?;

        info!("Connecting to TCP peer at {}", remote_addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(remote_addr))
            .await
            .map_err(|_| {
                TransportError::timeout("TCP connect", self.config.connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                TransportError::connection_with_source("Failed to connect to TCP peer", Some(remote_addr), e)
            })?;

        info!("Successfully connected to TCP peer at {}", remote_addr);
        Ok(from_stream(stream, remote_addr, &self.config))
    }
}
