//! Bus operations and operation lists
//!
//! An [`OperationList`] is the unit every device driver composes: an ordered
//! sequence of VME bus cycles, controller register accesses, delays and
//! markers. Lists are pure data. They are turned into wire packets by
//! [`crate::codec`] and executed by a transport.
//!
//! All validation happens when an [`Operation`] is constructed, so a list that
//! exists is always encodable apart from the controller-wide size limits
//! checked by the encoder.
//!
//! # Example
//! ```
//! use protocol::{AddressModifier, OperationList};
//!
//! let mut list = OperationList::new();
//! list.add_write32(0x0010_0000, AddressModifier::A32UserData, 0xdead_beef).unwrap();
//! list.add_delay(10);
//! list.add_block_read32(0x0010_1000, AddressModifier::A32UserBlock, 64).unwrap();
//! assert_eq!(list.len(), 3);
//! assert_eq!(list.size(), 3 + 1 + 3);
//! ```

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

/// VME address modifier
///
/// Only the modifiers the controller can issue are representable. Raw values
/// are checked with [`AddressModifier::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AddressModifier {
    A32UserData = 0x09,
    A32UserProgram = 0x0a,
    A32UserBlock = 0x0b,
    A32PrivData = 0x0d,
    A32PrivProgram = 0x0e,
    A32PrivBlock = 0x0f,
    A16User = 0x29,
    A16Priv = 0x2d,
    A24UserData = 0x39,
    A24UserProgram = 0x3a,
    A24UserBlock = 0x3b,
    A24PrivData = 0x3d,
    A24PrivProgram = 0x3e,
    A24PrivBlock = 0x3f,
}

impl AddressModifier {
    /// Every legal modifier, in numeric order
    pub const ALL: [AddressModifier; 14] = [
        Self::A32UserData,
        Self::A32UserProgram,
        Self::A32UserBlock,
        Self::A32PrivData,
        Self::A32PrivProgram,
        Self::A32PrivBlock,
        Self::A16User,
        Self::A16Priv,
        Self::A24UserData,
        Self::A24UserProgram,
        Self::A24UserBlock,
        Self::A24PrivData,
        Self::A24PrivProgram,
        Self::A24PrivBlock,
    ];

    /// Validate a raw 8-bit modifier
    pub fn from_raw(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|am| am.raw() == value)
            .ok_or_else(|| {
                ProtocolError::invalid_operation(format!(
                    "address modifier {:#04x} is not supported",
                    value
                ))
            })
    }

    /// Raw 8-bit value placed on the bus
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Number of significant address bits for this space
    pub fn address_bits(self) -> u32 {
        match self {
            Self::A16User | Self::A16Priv => 16,
            Self::A24UserData
            | Self::A24UserProgram
            | Self::A24UserBlock
            | Self::A24PrivData
            | Self::A24PrivProgram
            | Self::A24PrivBlock => 24,
            _ => 32,
        }
    }
}

impl TryFrom<u8> for AddressModifier {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_raw(value)
    }
}

impl fmt::Display for AddressModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.raw())
    }
}

/// Data width of a single VME cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataWidth {
    D8,
    D16,
    D32,
}

impl DataWidth {
    /// Validate a width given in bits
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            8 => Ok(Self::D8),
            16 => Ok(Self::D16),
            32 => Ok(Self::D32),
            other => Err(ProtocolError::invalid_operation(format!(
                "data width {} is not one of 8, 16, 32",
                other
            ))),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::D8 => 8,
            Self::D16 => 16,
            Self::D32 => 32,
        }
    }

    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }

    fn max_datum(self) -> u32 {
        match self {
            Self::D8 => u8::MAX as u32,
            Self::D16 => u16::MAX as u32,
            Self::D32 => u32::MAX,
        }
    }

    fn alignment_mask(self) -> u32 {
        match self {
            Self::D8 => 0,
            Self::D16 => 0x1,
            Self::D32 => 0x3,
        }
    }
}

impl fmt::Display for DataWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.bits())
    }
}

/// A single bus operation
///
/// Build operations through the checked constructors ([`Operation::write`],
/// [`Operation::block_read`], ...). Transfer counts are non-zero by type.
/// An operation assembled from its fields is checked again by
/// [`OperationList::append`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Single VME write cycle
    Write {
        width: DataWidth,
        address: u32,
        modifier: AddressModifier,
        datum: u32,
    },
    /// Single VME read cycle
    Read {
        width: DataWidth,
        address: u32,
        modifier: AddressModifier,
    },
    /// 32-bit block transfer with incrementing address
    BlockRead {
        address: u32,
        modifier: AddressModifier,
        count: NonZeroU32,
    },
    /// 32-bit block transfer from a fixed (FIFO) address
    FifoRead {
        address: u32,
        modifier: AddressModifier,
        count: NonZeroU32,
    },
    /// Read of a controller-internal register
    RegisterRead { register: u32 },
    /// Write of a controller-internal register
    RegisterWrite { register: u32, datum: u32 },
    /// Stack-execution pause, in controller clock ticks
    Delay { clocks: u8 },
    /// Literal 16-bit value inserted into the output stream
    Marker { value: u16 },
}

impl Operation {
    /// Checked single-cycle write
    pub fn write(
        width: DataWidth,
        address: u32,
        modifier: AddressModifier,
        datum: u32,
    ) -> Result<Self> {
        let op = Self::Write {
            width,
            address,
            modifier,
            datum,
        };
        op.validate()?;
        Ok(op)
    }

    /// Checked single-cycle read
    pub fn read(width: DataWidth, address: u32, modifier: AddressModifier) -> Result<Self> {
        let op = Self::Read {
            width,
            address,
            modifier,
        };
        op.validate()?;
        Ok(op)
    }

    /// Checked block read; `count` is the number of 32-bit transfers
    pub fn block_read(address: u32, modifier: AddressModifier, count: u32) -> Result<Self> {
        let count = nonzero_count(count, "block read")?;
        let op = Self::BlockRead {
            address,
            modifier,
            count,
        };
        op.validate()?;
        Ok(op)
    }

    /// Checked FIFO read; `count` is the number of 32-bit transfers
    pub fn fifo_read(address: u32, modifier: AddressModifier, count: u32) -> Result<Self> {
        let count = nonzero_count(count, "FIFO read")?;
        let op = Self::FifoRead {
            address,
            modifier,
            count,
        };
        op.validate()?;
        Ok(op)
    }

    /// Check alignment, address space and datum range
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Write {
                width,
                address,
                modifier,
                datum,
            } => {
                check_target(width, address, modifier)?;
                if datum > width.max_datum() {
                    return Err(ProtocolError::invalid_operation(format!(
                        "datum {:#x} does not fit in {}",
                        datum, width
                    )));
                }
                Ok(())
            }
            Self::Read {
                width,
                address,
                modifier,
            } => check_target(width, address, modifier),
            Self::BlockRead {
                address, modifier, ..
            }
            | Self::FifoRead {
                address, modifier, ..
            } => check_target(DataWidth::D32, address, modifier),
            Self::RegisterRead { .. }
            | Self::RegisterWrite { .. }
            | Self::Delay { .. }
            | Self::Marker { .. } => Ok(()),
        }
    }

    /// Number of 32-bit words this operation occupies in a packet
    pub fn word_count(&self) -> usize {
        match self {
            Self::Write { .. } | Self::RegisterWrite { .. } => 3,
            Self::BlockRead { .. } | Self::FifoRead { .. } => 3,
            Self::Read { .. } | Self::RegisterRead { .. } | Self::Marker { .. } => 2,
            Self::Delay { .. } => 1,
        }
    }

    /// Short name used in log and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Read { .. } => "read",
            Self::BlockRead { .. } => "block-read",
            Self::FifoRead { .. } => "fifo-read",
            Self::RegisterRead { .. } => "register-read",
            Self::RegisterWrite { .. } => "register-write",
            Self::Delay { .. } => "delay",
            Self::Marker { .. } => "marker",
        }
    }

    /// Target address (VME address or register index), if the operation has one
    pub fn address(&self) -> Option<u32> {
        match self {
            Self::Write { address, .. }
            | Self::Read { address, .. }
            | Self::BlockRead { address, .. }
            | Self::FifoRead { address, .. } => Some(*address),
            Self::RegisterRead { register } | Self::RegisterWrite { register, .. } => {
                Some(*register)
            }
            Self::Delay { .. } | Self::Marker { .. } => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write {
                width,
                address,
                modifier,
                datum,
            } => write!(f, "write {} {:#010x} am={} <- {:#x}", width, address, modifier, datum),
            Self::Read {
                width,
                address,
                modifier,
            } => write!(f, "read {} {:#010x} am={}", width, address, modifier),
            Self::BlockRead {
                address,
                modifier,
                count,
            } => write!(f, "block-read {:#010x} am={} x{}", address, modifier, count),
            Self::FifoRead {
                address,
                modifier,
                count,
            } => write!(f, "fifo-read {:#010x} am={} x{}", address, modifier, count),
            Self::RegisterRead { register } => write!(f, "register-read {:#06x}", register),
            Self::RegisterWrite { register, datum } => {
                write!(f, "register-write {:#06x} <- {:#x}", register, datum)
            }
            Self::Delay { clocks } => write!(f, "delay {}", clocks),
            Self::Marker { value } => write!(f, "marker {:#06x}", value),
        }
    }
}

fn check_target(width: DataWidth, address: u32, modifier: AddressModifier) -> Result<()> {
    if address & width.alignment_mask() != 0 {
        return Err(ProtocolError::invalid_operation(format!(
            "address {:#010x} is not aligned for {}",
            address, width
        )));
    }
    let bits = modifier.address_bits();
    if bits < 32 && address >> bits != 0 {
        return Err(ProtocolError::invalid_operation(format!(
            "address {:#010x} is outside the A{} space of am={}",
            address, bits, modifier
        )));
    }
    Ok(())
}

fn nonzero_count(count: u32, what: &str) -> Result<NonZeroU32> {
    NonZeroU32::new(count)
        .ok_or_else(|| ProtocolError::invalid_operation(format!("{} with zero transfers", what)))
}

/// Ordered list of bus operations
///
/// Operations are immutable once appended; the list itself can only grow or
/// be cleared. Equality compares the operations in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationList {
    operations: Vec<Operation>,
}

impl OperationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every operation
    pub fn clear(&mut self) {
        self.operations.clear();
    }

    /// Encoded size in 32-bit words
    pub fn size(&self) -> usize {
        self.operations.iter().map(Operation::word_count).sum()
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append one operation after checking it
    pub fn append(&mut self, operation: Operation) -> Result<()> {
        operation.validate()?;
        self.operations.push(operation);
        Ok(())
    }

    /// Append a copy of every operation of `other`, preserving order
    pub fn append_list(&mut self, other: &OperationList) {
        self.operations.extend(other.operations.iter().cloned());
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }

    pub fn add_write8(&mut self, address: u32, modifier: AddressModifier, datum: u8) -> Result<()> {
        self.push_checked(Operation::write(
            DataWidth::D8,
            address,
            modifier,
            datum.into(),
        ))
    }

    pub fn add_write16(
        &mut self,
        address: u32,
        modifier: AddressModifier,
        datum: u16,
    ) -> Result<()> {
        self.push_checked(Operation::write(
            DataWidth::D16,
            address,
            modifier,
            datum.into(),
        ))
    }

    pub fn add_write32(
        &mut self,
        address: u32,
        modifier: AddressModifier,
        datum: u32,
    ) -> Result<()> {
        self.push_checked(Operation::write(DataWidth::D32, address, modifier, datum))
    }

    pub fn add_read8(&mut self, address: u32, modifier: AddressModifier) -> Result<()> {
        self.push_checked(Operation::read(DataWidth::D8, address, modifier))
    }

    pub fn add_read16(&mut self, address: u32, modifier: AddressModifier) -> Result<()> {
        self.push_checked(Operation::read(DataWidth::D16, address, modifier))
    }

    pub fn add_read32(&mut self, address: u32, modifier: AddressModifier) -> Result<()> {
        self.push_checked(Operation::read(DataWidth::D32, address, modifier))
    }

    pub fn add_block_read32(
        &mut self,
        address: u32,
        modifier: AddressModifier,
        count: u32,
    ) -> Result<()> {
        self.push_checked(Operation::block_read(address, modifier, count))
    }

    pub fn add_fifo_read32(
        &mut self,
        address: u32,
        modifier: AddressModifier,
        count: u32,
    ) -> Result<()> {
        self.push_checked(Operation::fifo_read(address, modifier, count))
    }

    pub fn add_register_read(&mut self, register: u32) {
        self.operations.push(Operation::RegisterRead { register });
    }

    pub fn add_register_write(&mut self, register: u32, datum: u32) {
        self.operations.push(Operation::RegisterWrite { register, datum });
    }

    pub fn add_delay(&mut self, clocks: u8) {
        self.operations.push(Operation::Delay { clocks });
    }

    pub fn add_marker(&mut self, value: u16) {
        self.operations.push(Operation::Marker { value });
    }

    fn push_checked(&mut self, operation: Result<Operation>) -> Result<()> {
        self.operations.push(operation?);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a OperationList {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifier_from_raw() {
        assert_eq!(
            AddressModifier::from_raw(0x39).unwrap(),
            AddressModifier::A24UserData
        );
        assert_eq!(
            AddressModifier::from_raw(0x0b).unwrap(),
            AddressModifier::A32UserBlock
        );
        assert!(matches!(
            AddressModifier::from_raw(0x3c),
            Err(ProtocolError::InvalidOperation { .. })
        ));
        for am in AddressModifier::ALL {
            assert_eq!(AddressModifier::from_raw(am.raw()).unwrap(), am);
        }
    }

    #[test]
    fn test_width_from_bits() {
        assert_eq!(DataWidth::from_bits(16).unwrap(), DataWidth::D16);
        assert!(DataWidth::from_bits(24).is_err());
        assert!(DataWidth::from_bits(0).is_err());
    }

    #[test]
    fn test_zero_count_rejected() {
        let result = Operation::block_read(0x1000, AddressModifier::A32UserBlock, 0);
        assert!(matches!(result, Err(ProtocolError::InvalidOperation { .. })));
        let result = Operation::fifo_read(0x1000, AddressModifier::A32UserBlock, 0);
        assert!(matches!(result, Err(ProtocolError::InvalidOperation { .. })));
    }

    #[test]
    fn test_datum_must_fit_width() {
        let result = Operation::write(DataWidth::D16, 0x10, AddressModifier::A24UserData, 0x1_0000);
        assert!(result.is_err());
        let result = Operation::write(DataWidth::D8, 0x11, AddressModifier::A24UserData, 0xff);
        assert!(result.is_ok());
    }

    #[test]
    fn test_address_space() {
        assert!(Operation::read(DataWidth::D16, 0xfffe, AddressModifier::A16User).is_ok());
        assert!(Operation::read(DataWidth::D16, 0x1_0000, AddressModifier::A16User).is_err());
        assert!(Operation::write(DataWidth::D16, 0x00ff_fffe, AddressModifier::A24UserData, 1).is_ok());
        assert!(Operation::write(DataWidth::D16, 0x0100_0000, AddressModifier::A24UserData, 1).is_err());
        assert!(Operation::block_read(0x0100_0000, AddressModifier::A24UserBlock, 4).is_err());
        assert!(Operation::read(DataWidth::D32, 0xffff_fffc, AddressModifier::A32UserData).is_ok());
    }

    #[test]
    fn test_append_rejects_unchecked_operations() {
        let mut list = OperationList::new();
        let oversized = Operation::Write {
            width: DataWidth::D8,
            address: 0x10,
            modifier: AddressModifier::A32UserData,
            datum: 0x1234,
        };
        assert!(matches!(
            list.append(oversized),
            Err(ProtocolError::InvalidOperation { .. })
        ));
        let misaligned = Operation::Read {
            width: DataWidth::D32,
            address: 0x12,
            modifier: AddressModifier::A32UserData,
        };
        assert!(list.append(misaligned).is_err());
        assert!(list.is_empty());

        list.append(Operation::Delay { clocks: 4 }).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_alignment() {
        assert!(Operation::read(DataWidth::D32, 0x1002, AddressModifier::A32UserData).is_err());
        assert!(Operation::read(DataWidth::D16, 0x1001, AddressModifier::A32UserData).is_err());
        assert!(Operation::read(DataWidth::D16, 0x1002, AddressModifier::A32UserData).is_ok());
    }

    #[test]
    fn test_failed_add_leaves_list_untouched() {
        let mut list = OperationList::new();
        list.add_read32(0x100, AddressModifier::A32UserData).unwrap();
        assert!(list.add_block_read32(0x200, AddressModifier::A32UserBlock, 0).is_err());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_size_and_order() {
        let mut list = OperationList::new();
        list.add_register_write(0x04, 1);
        list.add_marker(0xaaaa);
        list.add_delay(3);
        list.add_read16(0x8000_0002, AddressModifier::A32UserData)
            .unwrap();
        assert_eq!(list.size(), 3 + 2 + 1 + 2);
        let kinds: Vec<_> = list.iter().map(Operation::kind).collect();
        assert_eq!(kinds, ["register-write", "marker", "delay", "read"]);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_append_list_and_equality() {
        let mut a = OperationList::new();
        a.add_write32(0x10, AddressModifier::A32UserData, 1).unwrap();
        let mut b = OperationList::new();
        b.add_write32(0x10, AddressModifier::A32UserData, 1).unwrap();
        assert_eq!(a, b);

        b.add_delay(1);
        assert_ne!(a, b);

        let mut c = OperationList::new();
        c.append_list(&b);
        assert_eq!(c, b);
    }
}
