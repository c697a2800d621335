//! CAMAC address translation
//!
//! A CAMAC branch is reached through a CAMAC-to-VME branch driver occupying
//! A24 space. Every (branch, crate, station, subaddress, function) tuple maps
//! to one VME address word:
//!
//! ```text
//! bit  23      marker (always set)
//! bits 19..21  branch      (3 bits)
//! bits 16..18  crate       (3 bits)
//! bits 11..15  station N   (5 bits)
//! bits  7..10  subaddress A (4 bits)
//! bits  2..6   function F  (5 bits)
//! bit   1      width selector (1 = 16-bit / low word, 0 = 24-bit high byte)
//! ```
//!
//! 24-bit transfers are not a single VME cycle: they are two D16 cycles to the
//! same base address, high byte first (width bit clear) then the low word
//! (width bit set), with a settling delay in between. The `add_camac_*`
//! helpers apply that rule when composing lists.

use crate::error::{ProtocolError, Result};
use crate::operation::{AddressModifier, OperationList};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WIDTH_SHIFT: u32 = 1;
pub const FUNCTION_SHIFT: u32 = 2;
pub const SUBADDRESS_SHIFT: u32 = 7;
pub const STATION_SHIFT: u32 = 11;
pub const CRATE_SHIFT: u32 = 16;
pub const BRANCH_SHIFT: u32 = 19;
pub const MARKER_BIT: u32 = 1 << 23;

pub const FUNCTION_BITS: u32 = 5;
pub const SUBADDRESS_BITS: u32 = 4;
pub const STATION_BITS: u32 = 5;
pub const CRATE_BITS: u32 = 3;
pub const BRANCH_BITS: u32 = 3;

const fn field_mask(bits: u32, shift: u32) -> u32 {
    ((1 << bits) - 1) << shift
}

pub const WIDTH_MASK: u32 = 1 << WIDTH_SHIFT;
pub const FUNCTION_MASK: u32 = field_mask(FUNCTION_BITS, FUNCTION_SHIFT);
pub const SUBADDRESS_MASK: u32 = field_mask(SUBADDRESS_BITS, SUBADDRESS_SHIFT);
pub const STATION_MASK: u32 = field_mask(STATION_BITS, STATION_SHIFT);
pub const CRATE_MASK: u32 = field_mask(CRATE_BITS, CRATE_SHIFT);
pub const BRANCH_MASK: u32 = field_mask(BRANCH_BITS, BRANCH_SHIFT);

/// Every bit with a defined meaning
pub const KNOWN_MASK: u32 = WIDTH_MASK
    | FUNCTION_MASK
    | SUBADDRESS_MASK
    | STATION_MASK
    | CRATE_MASK
    | BRANCH_MASK
    | MARKER_BIT;

/// Address modifier used for every bridge access
pub const CAMAC_MODIFIER: AddressModifier = AddressModifier::A24UserData;

/// Delay inserted between the two halves of a 24-bit transfer
pub const SPLIT_DELAY_CLOCKS: u8 = 10;

/// Branch driver internal registers live at crate 0, station 29
pub const BRIDGE_CRATE: u8 = 0;
pub const BRIDGE_STATION: u8 = 29;
/// Control/status register
pub const CSR_SUBADDRESS: u8 = 0;
/// Interrupt flag/mask register
pub const IFR_SUBADDRESS: u8 = 1;
/// Crate address register
pub const CAR_SUBADDRESS: u8 = 2;
/// Branch test register (one bit per on-line crate)
pub const BTB_SUBADDRESS: u8 = 3;

/// Q response in the CSR
pub const CSR_Q: u32 = 0x8000;
/// X response in the CSR
pub const CSR_X: u32 = 0x4000;

/// CAMAC transfer width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CamacWidth {
    #[serde(rename = "16")]
    Bits16,
    #[serde(rename = "24")]
    Bits24,
}

impl CamacWidth {
    /// Width selector bit for a whole transfer of this width
    fn selector(self) -> u32 {
        match self {
            Self::Bits16 => WIDTH_MASK,
            Self::Bits24 => 0,
        }
    }
}

impl fmt::Display for CamacWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bits16 => f.write_str("16"),
            Self::Bits24 => f.write_str("24"),
        }
    }
}

/// Kind of a CAMAC function code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionClass {
    /// F0..F7
    Read,
    /// F16..F23
    Write,
    /// F8..F15, F24..F31
    Control,
}

impl FunctionClass {
    pub fn of(function: u8) -> Self {
        match function {
            0..=7 => Self::Read,
            16..=23 => Self::Write,
            _ => Self::Control,
        }
    }
}

/// A validated BCNAF tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCamacAddress", into = "RawCamacAddress")]
pub struct CamacAddress {
    branch: u8,
    crate_: u8,
    station: u8,
    subaddress: u8,
    function: u8,
}

#[derive(Serialize, Deserialize)]
struct RawCamacAddress {
    branch: u8,
    #[serde(rename = "crate")]
    crate_: u8,
    station: u8,
    subaddress: u8,
    function: u8,
}

impl TryFrom<RawCamacAddress> for CamacAddress {
    type Error = ProtocolError;

    fn try_from(raw: RawCamacAddress) -> Result<Self> {
        Self::new(raw.branch, raw.crate_, raw.station, raw.subaddress, raw.function)
    }
}

impl From<CamacAddress> for RawCamacAddress {
    fn from(addr: CamacAddress) -> Self {
        Self {
            branch: addr.branch,
            crate_: addr.crate_,
            station: addr.station,
            subaddress: addr.subaddress,
            function: addr.function,
        }
    }
}

fn check_field(field: &'static str, value: u8, bits: u32) -> Result<()> {
    let limit = 1u32 << bits;
    if u32::from(value) >= limit {
        return Err(ProtocolError::InvalidAddress {
            field,
            value: value.into(),
            limit,
        });
    }
    Ok(())
}

impl CamacAddress {
    /// Validate a BCNAF tuple; out-of-range fields are rejected, never wrapped
    pub fn new(branch: u8, crate_: u8, station: u8, subaddress: u8, function: u8) -> Result<Self> {
        check_field("branch", branch, BRANCH_BITS)?;
        check_field("crate", crate_, CRATE_BITS)?;
        check_field("station", station, STATION_BITS)?;
        check_field("subaddress", subaddress, SUBADDRESS_BITS)?;
        check_field("function", function, FUNCTION_BITS)?;
        Ok(Self {
            branch,
            crate_,
            station,
            subaddress,
            function,
        })
    }

    pub fn branch(&self) -> u8 {
        self.branch
    }

    pub fn crate_number(&self) -> u8 {
        self.crate_
    }

    pub fn station(&self) -> u8 {
        self.station
    }

    pub fn subaddress(&self) -> u8 {
        self.subaddress
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    pub fn function_class(&self) -> FunctionClass {
        FunctionClass::of(self.function)
    }

    /// Pack into the bridge address word
    pub fn pack(&self, width: CamacWidth) -> PackedAddress {
        let word = MARKER_BIT
            | (u32::from(self.branch) << BRANCH_SHIFT)
            | (u32::from(self.crate_) << CRATE_SHIFT)
            | (u32::from(self.station) << STATION_SHIFT)
            | (u32::from(self.subaddress) << SUBADDRESS_SHIFT)
            | (u32::from(self.function) << FUNCTION_SHIFT)
            | width.selector();
        PackedAddress(word)
    }
}

impl fmt::Display for CamacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{} C{} N{} A{} F{}",
            self.branch, self.crate_, self.station, self.subaddress, self.function
        )
    }
}

/// Validate and pack a BCNAF tuple
///
/// # Example
/// ```
/// use protocol::camac::{convert, decode, CamacWidth};
///
/// let packed = convert(2, 1, 5, 3, 0, CamacWidth::Bits16).unwrap();
/// let decoded = decode(packed.word());
/// assert_eq!(decoded.address.station(), 5);
/// assert_eq!(decoded.width, CamacWidth::Bits16);
/// assert_eq!(decoded.extra_bits, 0);
/// ```
pub fn convert(
    branch: u8,
    crate_: u8,
    station: u8,
    subaddress: u8,
    function: u8,
    width: CamacWidth,
) -> Result<PackedAddress> {
    Ok(CamacAddress::new(branch, crate_, station, subaddress, function)?.pack(width))
}

/// Result of unpacking an address word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddress {
    pub address: CamacAddress,
    pub width: CamacWidth,
    /// Whether the fixed marker bit was present
    pub marker: bool,
    /// Bits outside every known field
    pub extra_bits: u32,
}

/// Unpack an address word
///
/// Field values are always in range because they are masked out of the word;
/// anything outside the known fields is reported in `extra_bits`.
pub fn decode(word: u32) -> DecodedAddress {
    let field = |mask: u32, shift: u32| ((word & mask) >> shift) as u8;
    let address = CamacAddress {
        branch: field(BRANCH_MASK, BRANCH_SHIFT),
        crate_: field(CRATE_MASK, CRATE_SHIFT),
        station: field(STATION_MASK, STATION_SHIFT),
        subaddress: field(SUBADDRESS_MASK, SUBADDRESS_SHIFT),
        function: field(FUNCTION_MASK, FUNCTION_SHIFT),
    };
    let width = if word & WIDTH_MASK != 0 {
        CamacWidth::Bits16
    } else {
        CamacWidth::Bits24
    };
    DecodedAddress {
        address,
        width,
        marker: word & MARKER_BIT != 0,
        extra_bits: word & !KNOWN_MASK,
    }
}

/// A bridge address word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedAddress(u32);

impl PackedAddress {
    pub fn word(self) -> u32 {
        self.0
    }

    /// The high-byte half of a 24-bit transfer (width selector clear)
    pub fn high_half(self) -> Self {
        Self(self.0 & !WIDTH_MASK)
    }

    /// The low-word half of a 24-bit transfer (width selector set)
    pub fn low_half(self) -> Self {
        Self(self.0 | WIDTH_MASK)
    }
}

impl fmt::Display for PackedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}

/// Address of a branch driver internal register
pub fn bridge_register(branch: u8, subaddress: u8, function: u8) -> Result<CamacAddress> {
    CamacAddress::new(branch, BRIDGE_CRATE, BRIDGE_STATION, subaddress, function)
}

/// Q and X responses of the last CAMAC cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QxStatus {
    pub q: bool,
    pub x: bool,
}

impl QxStatus {
    /// Extract Q and X from a CSR value
    pub fn from_csr(csr: u32) -> Self {
        Self {
            q: csr & CSR_Q != 0,
            x: csr & CSR_X != 0,
        }
    }
}

impl fmt::Display for QxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q={} X={}", u8::from(self.q), u8::from(self.x))
    }
}

fn require_class(addr: &CamacAddress, expected: FunctionClass) -> Result<()> {
    let class = addr.function_class();
    if class != expected {
        return Err(ProtocolError::InvalidOperation {
            reason: format!(
                "{} is a {:?} function, expected {:?}",
                addr, class, expected
            ),
        });
    }
    Ok(())
}

/// Append a 16-bit CAMAC read
pub fn add_camac_read16(list: &mut OperationList, addr: &CamacAddress) -> Result<()> {
    require_class(addr, FunctionClass::Read)?;
    list.add_read16(addr.pack(CamacWidth::Bits16).word(), CAMAC_MODIFIER)
}

/// Append a 24-bit CAMAC read: high byte, delay, low word
pub fn add_camac_read24(list: &mut OperationList, addr: &CamacAddress) -> Result<()> {
    require_class(addr, FunctionClass::Read)?;
    let base = addr.pack(CamacWidth::Bits24);
    list.add_read16(base.high_half().word(), CAMAC_MODIFIER)?;
    list.add_delay(SPLIT_DELAY_CLOCKS);
    list.add_read16(base.low_half().word(), CAMAC_MODIFIER)
}

/// Append a 16-bit CAMAC write
pub fn add_camac_write16(list: &mut OperationList, addr: &CamacAddress, datum: u16) -> Result<()> {
    require_class(addr, FunctionClass::Write)?;
    list.add_write16(addr.pack(CamacWidth::Bits16).word(), CAMAC_MODIFIER, datum)
}

/// Append a 24-bit CAMAC write: high byte, delay, low word
pub fn add_camac_write24(list: &mut OperationList, addr: &CamacAddress, datum: u32) -> Result<()> {
    require_class(addr, FunctionClass::Write)?;
    if datum > 0x00ff_ffff {
        return Err(ProtocolError::InvalidOperation {
            reason: format!("datum {:#x} does not fit in 24 bits", datum),
        });
    }
    let base = addr.pack(CamacWidth::Bits24);
    list.add_write16(
        base.high_half().word(),
        CAMAC_MODIFIER,
        ((datum >> 16) & 0xff) as u16,
    )?;
    list.add_delay(SPLIT_DELAY_CLOCKS);
    list.add_write16(base.low_half().word(), CAMAC_MODIFIER, (datum & 0xffff) as u16)
}

/// Append a dataless control cycle
pub fn add_camac_control(list: &mut OperationList, addr: &CamacAddress) -> Result<()> {
    require_class(addr, FunctionClass::Control)?;
    list.add_read16(addr.pack(CamacWidth::Bits16).word(), CAMAC_MODIFIER)
}
