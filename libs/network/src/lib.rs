//! Network Infrastructure
//!
//! Framed, bidirectional connections between Cascade nodes.
//!
//! ## What This Crate Contains
//! - [`Connection`]: a reliable ordered stream of frames with split halves
//! - [`Acceptor`] / [`Connector`]: the server and client sides of the boundary
//! - TCP transport (4-byte big-endian length prefix) and an in-process duplex
//!
//! ## What This Crate Does NOT Contain
//! - Envelope encoding (see `codec`)
//! - Routing or dispatch (see `cascade`)

pub mod error;
pub mod transports;

pub use error::{Result, TransportError};
pub use transports::{
    duplex, Acceptor, Connection, Connector, FrameSink, FrameSource, LocalAcceptor,
    LocalConnector, TcpAcceptor, TcpConfig, TcpConnector,
};

/// Default upper bound on a single frame
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
