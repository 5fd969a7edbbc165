//! Protocol error types

use thiserror::Error;

/// Wire format errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Setup packet shorter or longer than 8 bytes
    #[error("Invalid setup packet length: {actual} bytes (expected {expected})")]
    InvalidSetupLength { expected: usize, actual: usize },

    /// Payload length does not match wLength of the setup packet
    #[error("Payload length mismatch: setup declares {declared} bytes, payload has {actual}")]
    PayloadLengthMismatch { declared: u16, actual: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
