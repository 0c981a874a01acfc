//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown multiplexer frame kind
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Unknown control message kind
    #[error("Unknown control message kind: {0:#04x}")]
    UnknownControlKind(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Frame payload does not match what its kind requires
    #[error("Invalid payload for {kind} frame: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The stream ended in the middle of a frame
    #[error("Torn frame: stream ended with {buffered} bytes of an incomplete frame")]
    TornFrame { buffered: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
