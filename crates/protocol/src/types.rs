//! Transaction result types
//!
//! Transport-level outcomes are reported as values. A failed transaction is
//! never retried at this layer and its status must not be dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB error kinds reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbError {
    /// Transfer timed out
    Timeout,
    /// Pipe error (endpoint halted)
    Pipe,
    /// Device disconnected
    NoDevice,
    /// Entity not found
    NotFound,
    /// Resource busy
    Busy,
    /// Buffer overflow
    Overflow,
    /// I/O error
    Io,
    /// Invalid parameter
    InvalidParam,
    /// Access denied
    Access,
    /// Other error with description
    Other { message: String },
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("operation timed out"),
            Self::Pipe => f.write_str("pipe error"),
            Self::NoDevice => f.write_str("no such device (it may have been disconnected)"),
            Self::NotFound => f.write_str("entity not found"),
            Self::Busy => f.write_str("resource busy"),
            Self::Overflow => f.write_str("overflow"),
            Self::Io => f.write_str("input/output error"),
            Self::InvalidParam => f.write_str("invalid parameter"),
            Self::Access => f.write_str("access denied (insufficient permissions)"),
            Self::Other { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for UsbError {}

/// Outcome of one transport transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Ok,
    WriteFailed(UsbError),
    ReadFailed(UsbError),
}

impl TransactionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// The underlying USB error, if any
    pub fn error(&self) -> Option<&UsbError> {
        match self {
            Self::Ok => None,
            Self::WriteFailed(e) | Self::ReadFailed(e) => Some(e),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::WriteFailed(e) => write!(f, "write failed: {}", e),
            Self::ReadFailed(e) => write!(f, "read failed: {}", e),
        }
    }
}

/// Status plus the number of bytes moved
#[must_use = "a transaction status must be checked"]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: TransactionStatus,
    pub bytes: usize,
}

impl TransactionResult {
    pub fn ok(bytes: usize) -> Self {
        Self {
            status: TransactionStatus::Ok,
            bytes,
        }
    }

    pub fn write_failed(error: UsbError) -> Self {
        Self {
            status: TransactionStatus::WriteFailed(error),
            bytes: 0,
        }
    }

    pub fn read_failed(error: UsbError) -> Self {
        Self {
            status: TransactionStatus::ReadFailed(error),
            bytes: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Byte count on success, the status otherwise
    pub fn into_result(self) -> Result<usize, TransactionStatus> {
        match self.status {
            TransactionStatus::Ok => Ok(self.bytes),
            status => Err(status),
        }
    }
}
