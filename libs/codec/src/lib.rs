//! # Cascade Codec
//!
//! Payload and envelope encoding for the Cascade dispatch network.
//!
//! ## What This Crate Contains
//! - [`Document`]: the structured payload tree (tag, value, attributes, ordered
//!   children) and its linear byte form
//! - [`Invoke`]: the RPC envelope, a listener name plus ordered typed
//!   parameters, and its fixed document shape
//!
//! ## What This Crate Does NOT Contain
//! - Framing, sockets or connection handling (belongs in `network`)
//! - Handler lookup and routing (belongs in `cascade`)
//!
//! ## Architecture Role
//!
//! ```text
//! application payload → [Document] → [Invoke] → bytes → network/
//! ```

pub mod document;
pub mod error;
pub mod invoke;

pub use document::{Document, MAX_DEPTH, MAX_ENCODED_SIZE};
pub use error::{CodecError, Result};
pub use invoke::{
    Invoke, InvokeParameter, ParameterValue, HISTORY_UID, INVOKE_TAG, LOST_PIECES, LOST_RANGES,
    MAX_EXACT_INTEGER, PARAMETER_TAG, PIECE_FIRST, PIECE_SIZE,
};
