//! Codec errors for documents and Invoke envelopes
//!
//! Every decoding failure surfaces as a [`CodecError`]. Callers on the receive
//! path treat all of them as a format error: the offending frame is dropped and
//! logged while the connection stays open.

use thiserror::Error;

/// Document and envelope decoding errors with the context needed to diagnose them
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Linear byte encoding could not be produced or parsed
    #[error("Document encoding failed: {message} ({bytes} bytes)")]
    Encoding { message: String, bytes: usize },

    /// Root element is not an invoke envelope
    #[error("Unexpected root tag: expected '{expected}', got '{actual}'")]
    UnexpectedTag { expected: String, actual: String },

    /// Envelope carries no listener name
    #[error("Invoke envelope has no listener name")]
    MissingListener,

    /// Parameter declares a type tag this codec does not know
    #[error("Unknown parameter type '{type_tag}' at position {index}")]
    UnknownParameterType { type_tag: String, index: usize },

    /// Parameter value cannot be parsed as its declared type
    #[error("Invalid {type_tag} value at position {index}: {value:?}")]
    InvalidValue {
        type_tag: String,
        index: usize,
        value: String,
    },

    /// Document parameter carries no nested document
    #[error("Document parameter at position {index} has no child")]
    MissingDocument { index: usize },

    /// Accessor asked for a type the parameter does not hold
    #[error("Parameter type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Number cannot be represented as the requested integer
    #[error("Number {value} is not representable as {target}")]
    NumberOutOfRange { value: f64, target: &'static str },

    /// Handler expected a different number of positional arguments
    #[error("Listener '{listener}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        listener: String,
        expected: usize,
        actual: usize,
    },

    /// Positional argument is absent
    #[error("Missing argument at position {index}")]
    MissingArgument { index: usize },

    /// Reserved bookkeeping parameter is absent
    #[error("Missing reserved parameter '{name}'")]
    MissingReserved { name: String },
}

impl CodecError {
    /// Create an encoding error from any displayable source
    pub fn encoding(message: impl std::fmt::Display, bytes: usize) -> Self {
        Self::Encoding {
            message: message.to_string(),
            bytes,
        }
    }
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
