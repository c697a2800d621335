//! Packet encoding and decoding
//!
//! Converts an [`OperationList`] into the packet the controller firmware
//! consumes, and disassembles reply buffers into words.
//!
//! # Packet Format
//!
//! All fields are little-endian 16-bit units; 32-bit values are written low
//! word first.
//!
//! ```text
//! immediate:  [TA: u16][length: u32][body...]
//! stack load: [TA: u16][length: u16][offset: u16][body...]
//! ```
//!
//! The immediate length counts the 16-bit words of the body. The stack length
//! counts every 16-bit word that follows it, i.e. the offset word plus the body.
//!
//! Each operation in the body is a mode word followed by its address and data
//! words (see [`Operation::word_count`]).

use crate::error::{ProtocolError, Result};
use crate::operation::{AddressModifier, DataWidth, Operation, OperationList};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

// Transfer-address header bits
pub const TA_ID0: u16 = 0x0001;
pub const TA_SEL: u16 = 0x0002;
pub const TA_WRITE: u16 = 0x0004;
pub const TA_IMMED: u16 = 0x0008;
pub const TA_ID1: u16 = 0x0010;
pub const TA_ID2: u16 = 0x0020;

// Mode word bits
pub const MODE_AM_MASK: u32 = 0x0000_003f;
pub const MODE_DS0: u32 = 0x0000_0040;
pub const MODE_DS1: u32 = 0x0000_0080;
pub const MODE_NA: u32 = 0x0000_0100;
pub const MODE_MB: u32 = 0x0000_0200;
pub const MODE_SLF: u32 = 0x0000_0400;
pub const MODE_NW: u32 = 0x0000_0800;
pub const MODE_LW: u32 = 0x0000_1000;
pub const MODE_DLY: u32 = 0x0000_2000;
pub const MODE_MRK: u32 = 0x0000_4000;
pub const MODE_DELAY_SHIFT: u32 = 16;
pub const MODE_DELAY_MASK: u32 = 0x00ff_0000;

const MODE_KNOWN: u32 = MODE_AM_MASK
    | MODE_DS0
    | MODE_DS1
    | MODE_NA
    | MODE_MB
    | MODE_SLF
    | MODE_NW
    | MODE_LW
    | MODE_DLY
    | MODE_MRK
    | MODE_DELAY_MASK;

/// Maximum number of transfers in one block or FIFO read
pub const MAX_BLOCK_TRANSFERS: u32 = 4096;

/// Stack memory size, in 16-bit words
pub const STACK_MEMORY_WORDS: usize = 0x800;

/// Largest immediate body, in 16-bit words
pub const MAX_IMMEDIATE_WORDS: usize = 0x2000;

// Action register fast path: [TA, register selector, value]
pub const ACTION_TA: u16 = 0x0005;
pub const ACTION_SELECTOR: u16 = 0x000a;

/// Stack slot number (0..8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StackSlot(u8);

impl StackSlot {
    pub const COUNT: u8 = 8;

    pub fn new(slot: u8) -> Result<Self> {
        if slot < Self::COUNT {
            Ok(Self(slot))
        } else {
            Err(ProtocolError::StackSlot(slot))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Header bits selecting this slot; bit 0 of the number goes to ID0,
    /// bits 1 and 2 to ID1 and ID2
    fn ta_bits(self) -> u16 {
        let mut bits = 0;
        if self.0 & 0x1 != 0 {
            bits |= TA_ID0;
        }
        if self.0 & 0x2 != 0 {
            bits |= TA_ID1;
        }
        if self.0 & 0x4 != 0 {
            bits |= TA_ID2;
        }
        bits
    }

    fn from_ta(ta: u16) -> Self {
        let mut slot = 0;
        if ta & TA_ID0 != 0 {
            slot |= 0x1;
        }
        if ta & TA_ID1 != 0 {
            slot |= 0x2;
        }
        if ta & TA_ID2 != 0 {
            slot |= 0x4;
        }
        Self(slot)
    }
}

impl TryFrom<u8> for StackSlot {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StackSlot> for u8 {
    fn from(slot: StackSlot) -> u8 {
        slot.0
    }
}

impl fmt::Display for StackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack {}", self.0)
    }
}

/// How a packet is dispatched by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Execute once, now
    Immediate,
    /// Store into stack memory for trigger-driven execution
    Stack { slot: StackSlot, offset: u16 },
}

/// Decoded transfer-address header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ta: u16,
    pub dispatch: Dispatch,
    pub write: bool,
    /// Raw length field
    pub length: u32,
}

/// Encode a list for immediate execution
///
/// # Example
/// ```
/// use protocol::{AddressModifier, OperationList, encode_immediate};
///
/// let mut list = OperationList::new();
/// list.add_read32(0x1000, AddressModifier::A32UserData).unwrap();
/// let packet = encode_immediate(&list).unwrap();
/// // TA + 32-bit length + two 32-bit words
/// assert_eq!(packet.len(), 2 + 4 + 8);
/// ```
pub fn encode_immediate(list: &OperationList) -> Result<Bytes> {
    let body_words = body_words(list);
    if body_words > MAX_IMMEDIATE_WORDS {
        return Err(ProtocolError::PacketTooLarge {
            words: body_words,
            max: MAX_IMMEDIATE_WORDS,
        });
    }

    let mut packet = BytesMut::with_capacity(6 + body_words * 2);
    packet.put_u16_le(TA_WRITE | TA_IMMED);
    put_u32(&mut packet, body_words as u32);
    put_body(&mut packet, list)?;
    Ok(packet.freeze())
}

/// Encode a list for loading into stack memory at `offset` (in 16-bit words)
pub fn encode_stack(list: &OperationList, slot: StackSlot, offset: u16) -> Result<Bytes> {
    let body_words = body_words(list);
    let end = usize::from(offset) + body_words;
    if end > STACK_MEMORY_WORDS || body_words + 1 > usize::from(u16::MAX) {
        return Err(ProtocolError::PacketTooLarge {
            words: end,
            max: STACK_MEMORY_WORDS,
        });
    }

    let mut packet = BytesMut::with_capacity(6 + body_words * 2);
    packet.put_u16_le(TA_WRITE | TA_SEL | slot.ta_bits());
    packet.put_u16_le((body_words + 1) as u16);
    packet.put_u16_le(offset);
    put_body(&mut packet, list)?;
    Ok(packet.freeze())
}

/// Encode an action-register write
pub fn encode_action_register(value: u16) -> Bytes {
    let mut packet = BytesMut::with_capacity(6);
    packet.put_u16_le(ACTION_TA);
    packet.put_u16_le(ACTION_SELECTOR);
    packet.put_u16_le(value);
    packet.freeze()
}

/// Decode a packet produced by [`encode_immediate`] or [`encode_stack`]
pub fn decode_packet(packet: &[u8]) -> Result<(PacketHeader, OperationList)> {
    let mut buf = packet;
    need(buf, 2, packet.len())?;
    let ta = buf.get_u16_le();
    let write = ta & TA_WRITE != 0;

    let (dispatch, length, body_words) = if ta & TA_IMMED != 0 {
        need(buf, 4, packet.len())?;
        let length = get_u32(&mut buf);
        (Dispatch::Immediate, length, length as usize)
    } else {
        need(buf, 4, packet.len())?;
        let length = buf.get_u16_le();
        let offset = buf.get_u16_le();
        let slot = StackSlot::from_ta(ta);
        let body = usize::from(length).saturating_sub(1);
        (Dispatch::Stack { slot, offset }, u32::from(length), body)
    };

    let header_len = packet.len() - buf.len();
    if buf.len() < body_words * 2 {
        return Err(ProtocolError::Truncated {
            expected: header_len + body_words * 2,
            actual: packet.len(),
        });
    }
    let mut body = &buf[..body_words * 2];

    let mut list = OperationList::new();
    while body.has_remaining() {
        list.append(get_operation(&mut body)?)?;
    }

    let header = PacketHeader {
        ta,
        dispatch,
        write,
        length,
    };
    Ok((header, list))
}

/// Disassemble a reply buffer into items of the given width
///
/// No interpretation is performed; 16- and 32-bit items are little-endian.
///
/// # Example
/// ```
/// use protocol::{DataWidth, decode_reply};
///
/// let words = decode_reply(&[0xef, 0xcd, 0xab, 0x00], DataWidth::D16).unwrap();
/// assert_eq!(words, vec![0xcdef, 0x00ab]);
/// ```
pub fn decode_reply(bytes: &[u8], width: DataWidth) -> Result<Vec<u32>> {
    if bytes.len() % width.bytes() != 0 {
        return Err(ProtocolError::Misaligned {
            len: bytes.len(),
            width: width.bytes(),
        });
    }

    let mut buf = bytes;
    let mut words = Vec::with_capacity(bytes.len() / width.bytes());
    while buf.has_remaining() {
        let word = match width {
            DataWidth::D8 => u32::from(buf.get_u8()),
            DataWidth::D16 => u32::from(buf.get_u16_le()),
            DataWidth::D32 => get_u32(&mut buf),
        };
        words.push(word);
    }
    Ok(words)
}

/// Number of reply bytes the controller returns for an immediate list
///
/// Single reads return at least one 16-bit item, block and FIFO reads one
/// 32-bit item per transfer, markers their 16-bit value.
pub fn reply_size(list: &OperationList) -> usize {
    list.iter()
        .map(|operation| match operation {
            Operation::Read { width, .. } => width.bytes().max(2),
            Operation::BlockRead { count, .. } | Operation::FifoRead { count, .. } => {
                count.get() as usize * 4
            }
            Operation::RegisterRead { .. } => 4,
            Operation::Marker { .. } => 2,
            Operation::Write { .. } | Operation::RegisterWrite { .. } | Operation::Delay { .. } => {
                0
            }
        })
        .sum()
}

/// Mode word for an operation (first word of its encoding)
pub fn mode_word(operation: &Operation) -> u32 {
    match operation {
        Operation::Write {
            width, modifier, ..
        } => width_bits(*width) | u32::from(modifier.raw()),
        Operation::Read {
            width, modifier, ..
        } => MODE_NW | width_bits(*width) | u32::from(modifier.raw()),
        Operation::BlockRead { modifier, .. } => {
            MODE_MB | MODE_NW | width_bits(DataWidth::D32) | u32::from(modifier.raw())
        }
        Operation::FifoRead { modifier, .. } => {
            MODE_MB | MODE_NA | MODE_NW | width_bits(DataWidth::D32) | u32::from(modifier.raw())
        }
        Operation::RegisterRead { .. } => MODE_SLF | MODE_NW | width_bits(DataWidth::D32),
        Operation::RegisterWrite { .. } => MODE_SLF | width_bits(DataWidth::D32),
        Operation::Delay { clocks } => MODE_DLY | (u32::from(*clocks) << MODE_DELAY_SHIFT),
        Operation::Marker { .. } => MODE_MRK,
    }
}

fn width_bits(width: DataWidth) -> u32 {
    match width {
        DataWidth::D8 => MODE_DS0,
        DataWidth::D16 => MODE_DS0 | MODE_DS1,
        DataWidth::D32 => MODE_DS0 | MODE_DS1 | MODE_LW,
    }
}

fn width_from_mode(mode: u32) -> Result<DataWidth> {
    if mode & MODE_LW != 0 {
        Ok(DataWidth::D32)
    } else if mode & MODE_DS1 != 0 {
        Ok(DataWidth::D16)
    } else if mode & MODE_DS0 != 0 {
        Ok(DataWidth::D8)
    } else {
        Err(ProtocolError::UnknownMode(mode))
    }
}

fn body_words(list: &OperationList) -> usize {
    list.size() * 2
}

fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u16_le(value as u16);
    buf.put_u16_le((value >> 16) as u16);
}

fn get_u32(buf: &mut &[u8]) -> u32 {
    let low = u32::from(buf.get_u16_le());
    let high = u32::from(buf.get_u16_le());
    low | (high << 16)
}

fn need(buf: &[u8], bytes: usize, total: usize) -> Result<()> {
    if buf.len() < bytes {
        return Err(ProtocolError::Truncated {
            expected: total - buf.len() + bytes,
            actual: total,
        });
    }
    Ok(())
}

fn put_body(buf: &mut BytesMut, list: &OperationList) -> Result<()> {
    for operation in list {
        put_u32(buf, mode_word(operation));
        match operation {
            Operation::Write { address, datum, .. } => {
                put_u32(buf, *address);
                put_u32(buf, *datum);
            }
            Operation::Read { address, .. } => put_u32(buf, *address),
            Operation::BlockRead { address, count, .. }
            | Operation::FifoRead { address, count, .. } => {
                if count.get() > MAX_BLOCK_TRANSFERS {
                    return Err(ProtocolError::BlockTooLarge {
                        count: count.get(),
                        max: MAX_BLOCK_TRANSFERS,
                    });
                }
                put_u32(buf, count.get());
                put_u32(buf, *address);
            }
            Operation::RegisterRead { register } => put_u32(buf, *register),
            Operation::RegisterWrite { register, datum } => {
                put_u32(buf, *register);
                put_u32(buf, *datum);
            }
            Operation::Delay { .. } => {}
            Operation::Marker { value } => put_u32(buf, u32::from(*value)),
        }
    }
    Ok(())
}

fn get_word(body: &mut &[u8]) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated {
            expected: 4,
            actual: body.remaining(),
        });
    }
    Ok(get_u32(body))
}

fn get_operation(body: &mut &[u8]) -> Result<Operation> {
    let mode = get_word(body)?;
    if mode & !MODE_KNOWN != 0 {
        return Err(ProtocolError::UnknownMode(mode));
    }

    if mode & MODE_MRK != 0 {
        let value = get_word(body)?;
        return Ok(Operation::Marker {
            value: value as u16,
        });
    }
    if mode & MODE_DLY != 0 {
        let clocks = ((mode & MODE_DELAY_MASK) >> MODE_DELAY_SHIFT) as u8;
        return Ok(Operation::Delay { clocks });
    }
    if mode & MODE_SLF != 0 {
        let register = get_word(body)?;
        if mode & MODE_NW != 0 {
            return Ok(Operation::RegisterRead { register });
        }
        let datum = get_word(body)?;
        return Ok(Operation::RegisterWrite { register, datum });
    }

    let modifier = AddressModifier::from_raw((mode & MODE_AM_MASK) as u8)
        .map_err(|_| ProtocolError::UnknownMode(mode))?;

    if mode & MODE_MB != 0 {
        let count = get_word(body)?;
        let address = get_word(body)?;
        let count = NonZeroU32::new(count).ok_or(ProtocolError::UnknownMode(mode))?;
        return Ok(if mode & MODE_NA != 0 {
            Operation::FifoRead {
                address,
                modifier,
                count,
            }
        } else {
            Operation::BlockRead {
                address,
                modifier,
                count,
            }
        });
    }

    let width = width_from_mode(mode)?;
    let address = get_word(body)?;
    if mode & MODE_NW != 0 {
        Ok(Operation::Read {
            width,
            address,
            modifier,
        })
    } else {
        let datum = get_word(body)?;
        Ok(Operation::Write {
            width,
            address,
            modifier,
            datum,
        })
    }
}
