//! Common error types

use protocol::{ProtocolError, TransactionStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// List construction, encoding or address validation failed; nothing was sent
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A USB transaction failed
    #[error("{op}{} failed: {status}", display_address(.address))]
    Transport {
        op: &'static str,
        address: Option<u32>,
        status: TransactionStatus,
    },

    /// Reply shorter than the list requires
    #[error("{op}: short reply, expected {expected} bytes, got {actual}")]
    ShortReply {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Arbiter error: {0}")]
    Arbiter(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transport(op: &'static str, address: Option<u32>, status: TransactionStatus) -> Self {
        Self::Transport {
            op,
            address,
            status,
        }
    }
}

fn display_address(address: &Option<u32>) -> String {
    match address {
        Some(address) => format!(" at {:#010x}", address),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::UsbError;

    #[test]
    fn test_transport_error_context() {
        let err = Error::transport(
            "camac write24",
            Some(0x0081_5040),
            TransactionStatus::WriteFailed(UsbError::Pipe),
        );
        let msg = err.to_string();
        assert!(msg.contains("camac write24"));
        assert!(msg.contains("0x00815040"));
        assert!(msg.contains("pipe error"));
    }

    #[test]
    fn test_transport_error_without_address() {
        let err = Error::transport(
            "action register",
            None,
            TransactionStatus::WriteFailed(UsbError::NoDevice),
        );
        assert_eq!(
            err.to_string(),
            "action register failed: write failed: no such device (it may have been disconnected)"
        );
    }
}
