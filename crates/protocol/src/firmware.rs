//! Controller firmware identification

use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal register holding the firmware id
pub const FIRMWARE_ID_REGISTER: u32 = 0x00;

/// Decoded firmware id register
///
/// ```text
/// bits 28..31 month   bits 24..27 year (since 2000)
/// bits 16..19 beta    bits 8..15 major   bits 0..7 minor
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareId {
    pub major: u8,
    pub minor: u8,
    pub beta: u8,
    pub year: u16,
    pub month: u8,
}

impl FirmwareId {
    pub fn from_register(value: u32) -> Self {
        Self {
            minor: (value & 0xff) as u8,
            major: ((value >> 8) & 0xff) as u8,
            beta: ((value >> 16) & 0xf) as u8,
            year: 2000 + ((value >> 24) & 0xf) as u16,
            month: ((value >> 28) & 0xf) as u8,
        }
    }

    /// Whether this firmware is at least `major.minor`
    pub fn at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for FirmwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:02x}", self.major, self.minor)?;
        if self.beta != 0 {
            write!(f, "b{}", self.beta)?;
        }
        write!(f, " ({:04}-{:02})", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_firmware_id() {
        let id = FirmwareId::from_register(0x7a00_0a05);
        assert_eq!(id.major, 0x0a);
        assert_eq!(id.minor, 0x05);
        assert_eq!(id.beta, 0);
        assert_eq!(id.year, 2010);
        assert_eq!(id.month, 7);
        assert_eq!(id.to_string(), "a.05 (2010-07)");
    }

    #[test]
    fn test_version_compare() {
        let id = FirmwareId::from_register(0x0000_0a05);
        assert!(id.at_least(0x0a, 0x00));
        assert!(id.at_least(0x0a, 0x05));
        assert!(!id.at_least(0x0a, 0x06));
        assert!(!id.at_least(0x0b, 0x00));
    }
}
