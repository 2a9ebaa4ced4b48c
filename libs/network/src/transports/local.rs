//! In-process transport
//!
//! Frames move over unbounded channels. Used to wire nodes together inside a
//! single process and in tests that should not depend on sockets.

use super::{Acceptor, Connection, Connector, FrameSink, FrameSource};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

struct LocalSink {
    peer: String,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

struct LocalSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl FrameSink for LocalSink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::closed(self.peer.clone()))?;
        tx.send(Bytes::copy_from_slice(frame))
            .map_err(|_| TransportError::closed(self.peer.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the peer's stream
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for LocalSource {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Create a connected pair. `a` talks to `b`; each end's peer label names the other.
pub fn duplex(a_label: &str, b_label: &str) -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = Connection::new(
        b_label,
        Box::new(LocalSink {
            peer: b_label.to_string(),
            tx: Some(a_tx),
        }),
        Box::new(LocalSource { rx: a_rx }),
    );
    let b = Connection::new(
        a_label,
        Box::new(LocalSink {
            peer: a_label.to_string(),
            tx: Some(b_tx),
        }),
        Box::new(LocalSource { rx: b_rx }),
    );
    (a, b)
}

/// Accepting end of an in-process listener
pub struct LocalAcceptor {
    label: String,
    incoming: mpsc::UnboundedReceiver<Connection>,
}

/// Dialing end of an in-process listener; cheap to clone
#[derive(Clone)]
pub struct LocalConnector {
    label: String,
    outgoing: mpsc::UnboundedSender<Connection>,
}

impl LocalAcceptor {
    /// Create a listener named `label` and a connector that reaches it
    pub fn new(label: impl Into<String>) -> (Self, LocalConnector) {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                label: label.clone(),
                incoming: rx,
            },
            LocalConnector {
                label,
                outgoing: tx,
            },
        )
    }
}

#[async_trait]
impl Acceptor for LocalAcceptor {
    async fn accept(&mut self) -> Result<Connection> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| TransportError::closed(self.label.clone()))
    }

    fn local_label(&self) -> String {
        self.label.clone()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    /// `address` is only used as this side's label on the accepted end
    async fn connect(&self, address: &str) -> Result<Connection> {
        let (ours, theirs) = duplex(address, &self.label);
        self.outgoing
            .send(theirs)
            .map_err(|_| TransportError::closed(self.label.clone()))?;
        debug!(listener = %self.label, client = %address, "Local connection established");
        Ok(ours)
    }
}
