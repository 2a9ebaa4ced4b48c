//! Framed Transport Layer
//!
//! The boundary between the dispatch core and the wire. A [`Connection`] is a
//! reliable ordered stream of frames, split into a [`FrameSink`] and a
//! [`FrameSource`] so one task can write while another reads. Connections are
//! produced by an [`Acceptor`] (server side) or a [`Connector`] (client side).

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub mod local;
pub mod tcp;

pub use local::{duplex, LocalAcceptor, LocalConnector};
pub use tcp::{TcpAcceptor, TcpConfig, TcpConnector};

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame; the peer receives it as a single `recv_frame` result
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Shut the write half down; the peer's source observes end of stream
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` once the peer closed the stream
    async fn recv_frame(&mut self) -> Result<Option<Bytes>>;
}

/// One established connection
pub struct Connection {
    peer: String,
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            peer: peer.into(),
            sink,
            source,
        }
    }

    /// Peer label for logging (socket address or local name)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (String, Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.peer, self.sink, self.source)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// Server side of the transport boundary
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection
    async fn accept(&mut self) -> Result<Connection>;

    /// Address this acceptor listens on
    fn local_label(&self) -> String;
}

/// Client side of the transport boundary
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `address`
    async fn connect(&self, address: &str) -> Result<Connection>;
}
