//! Acquisition buffer header
//!
//! Every buffer the controller streams while acquiring starts with a 16-bit
//! little-endian header word.

use serde::{Deserialize, Serialize};

pub const EVENT_COUNT_MASK: u16 = 0x0fff;
pub const CONTINUATION_BIT: u16 = 0x1000;
pub const SCALER_BIT: u16 = 0x2000;
pub const LAST_BUFFER_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHeader {
    /// Number of events in the buffer
    pub events: u16,
    /// The last event continues into the next buffer
    pub continuation: bool,
    /// Buffer holds scaler data rather than events
    pub scaler: bool,
    /// Final buffer after acquisition was stopped
    pub last: bool,
}

impl BufferHeader {
    pub fn from_word(word: u16) -> Self {
        Self {
            events: word & EVENT_COUNT_MASK,
            continuation: word & CONTINUATION_BIT != 0,
            scaler: word & SCALER_BIT != 0,
            last: word & LAST_BUFFER_BIT != 0,
        }
    }
}
