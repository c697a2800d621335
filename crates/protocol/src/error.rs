//! Protocol error types

use thiserror::Error;

/// Errors raised while building, encoding or decoding bus operations.
///
/// Every variant is detected before any hardware is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Malformed list element, rejected when the operation is constructed
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// CAMAC address field out of range
    #[error("Invalid CAMAC address: {field}={value} (must be < {limit})")]
    InvalidAddress {
        field: &'static str,
        value: u32,
        limit: u32,
    },

    /// Block or FIFO transfer count above the controller's single-block limit
    #[error("Block transfer too large: {count} transfers (max: {max})")]
    BlockTooLarge { count: u32, max: u32 },

    /// Encoded packet does not fit into the controller's memory
    #[error("Packet too large: {words} 16-bit words (max: {max})")]
    PacketTooLarge { words: usize, max: usize },

    /// Stack slot outside 0..8
    #[error("Invalid stack slot: {0} (must be < 8)")]
    StackSlot(u8),

    /// Reply length is not a multiple of the requested item width
    #[error("Misaligned reply: {len} bytes is not a multiple of {width} bytes")]
    Misaligned { len: usize, width: usize },

    /// Packet ended before the header or an operation was complete
    #[error("Truncated packet: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Mode word that does not describe any known operation
    #[error("Unknown mode word: {0:#010x}")]
    UnknownMode(u32),
}

impl ProtocolError {
    pub(crate) fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
