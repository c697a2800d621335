//! Wire protocol for USB-attached VME/CAMAC bus controllers
//!
//! This crate is pure data: it builds lists of bus operations, encodes them
//! into the packets the controller firmware consumes, translates CAMAC
//! addresses for the branch driver, and disassembles replies. No I/O happens
//! here.
//!
//! # Example
//!
//! ```
//! use protocol::{AddressModifier, OperationList, StackSlot};
//! use protocol::{decode_packet, encode_immediate, encode_stack};
//!
//! let mut list = OperationList::new();
//! list.add_write32(0x0010_0000, AddressModifier::A32UserData, 1).unwrap();
//!
//! // Run once
//! let immediate = encode_immediate(&list).unwrap();
//!
//! // Or store in stack slot 2 for trigger-driven execution
//! let stack = encode_stack(&list, StackSlot::new(2).unwrap(), 0).unwrap();
//!
//! // Both carry the same body behind different headers
//! assert_eq!(immediate[6..], stack[6..]);
//! let (_, decoded) = decode_packet(&stack).unwrap();
//! assert_eq!(decoded, list);
//! ```

pub mod buffer;
pub mod camac;
pub mod codec;
pub mod error;
pub mod firmware;
pub mod operation;
pub mod types;

pub use buffer::BufferHeader;
pub use camac::{CamacAddress, CamacWidth, DecodedAddress, FunctionClass, PackedAddress, QxStatus};
pub use codec::{
    Dispatch, MAX_BLOCK_TRANSFERS, PacketHeader, StackSlot, decode_packet, decode_reply,
    encode_action_register, encode_immediate, encode_stack, reply_size,
};
pub use error::{ProtocolError, Result};
pub use firmware::FirmwareId;
pub use operation::{AddressModifier, DataWidth, Operation, OperationList};
pub use types::{TransactionResult, TransactionStatus, UsbError};
