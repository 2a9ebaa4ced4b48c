//! Dispatch error types

use codec::CodecError;
use network::TransportError;
use thiserror::Error;

/// Errors raised by systems, arrays and rounds
#[derive(Error, Debug)]
pub enum SystemError {
    /// The connection behind a System is gone; terminal for that System
    #[error("Connection lost: {peer}")]
    ConnectionLost { peer: String },

    /// Malformed envelope or handler arity mismatch
    #[error("Format error: {0}")]
    Format(#[from] CodecError),

    /// No handler accepted the listener anywhere along the chain
    #[error("Unhandled invoke: {listener}")]
    UnhandledInvoke { listener: String },

    /// A round was requested while another is still collecting
    #[error("Allocation error: round {uid} is still in flight")]
    RoundInFlight { uid: u64 },

    /// A round was requested on an array with no connected systems
    #[error("Allocation error: no active systems")]
    NoActiveSystems,

    /// The piece range overflows or cannot travel exactly as a wire number
    #[error("Allocation error: piece range starting at {first} with {size} pieces is not representable")]
    InvalidPieceRange { first: u64, size: u64 },

    /// No upward connection has been established
    #[error("Not connected to a chief")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, SystemError>;

impl SystemError {
    pub fn connection_lost(peer: impl Into<String>) -> Self {
        Self::ConnectionLost { peer: peer.into() }
    }

    /// Errors from the allocation family are rejected before any network activity
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            Self::RoundInFlight { .. } | Self::NoActiveSystems | Self::InvalidPieceRange { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionLost { .. } => "connection_lost",
            Self::Format(_) => "format",
            Self::UnhandledInvoke { .. } => "unhandled",
            Self::RoundInFlight { .. } | Self::NoActiveSystems | Self::InvalidPieceRange { .. } => {
                "allocation"
            }
            Self::NotConnected => "not_connected",
            Self::Transport(_) => "transport",
        }
    }
}
