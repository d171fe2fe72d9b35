//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a frame.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A well-formed frame arrived in a state where it is not allowed.
    #[error("unexpected {frame} frame: {reason}")]
    UnexpectedFrame {
        /// Wire name of the offending frame.
        frame: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The transport delivered something that is not a text frame.
    #[error("unsupported message: {0}")]
    UnsupportedMessage(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
