//! Controller transport
//!
//! [`Transport`] is the seam between the pure protocol and the USB link: a
//! symmetric write-then-read transaction, plain writes, and raw streaming
//! reads. Implementations perform no locking; exclusive use is arranged by
//! [`crate::ResourceArbiter`].
//!
//! [`TransportExt`] builds the list-level operations (immediate execution,
//! stack loading, register fast paths) on top of any transport.

use crate::error::{Error, Result};
use protocol::codec::{self, StackSlot};
use protocol::firmware::{FIRMWARE_ID_REGISTER, FirmwareId};
use protocol::{DataWidth, OperationList, ProtocolError, TransactionResult};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for controller transactions
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Action register bits
pub mod action {
    pub const START_DAQ: u16 = 0x0001;
    pub const USB_TRIGGER: u16 = 0x0002;
    pub const CLEAR: u16 = 0x0004;
    pub const SYS_RESET: u16 = 0x0008;
    pub const SCALER_DUMP: u16 = 0x0010;
}

/// Internal register indices
pub mod register {
    pub const FIRMWARE_ID: u32 = protocol::firmware::FIRMWARE_ID_REGISTER;
    pub const GLOBAL_MODE: u32 = 0x04;
    pub const DAQ_SETTINGS: u32 = 0x08;
    pub const LED_SOURCE: u32 = 0x0c;
    pub const DEVICE_SOURCE: u32 = 0x10;
    pub const TRIGGER_VECTOR_12: u32 = 0x28;
    pub const TRIGGER_VECTOR_34: u32 = 0x2c;
    pub const TRIGGER_VECTOR_56: u32 = 0x30;
    pub const TRIGGER_VECTOR_78: u32 = 0x34;
    pub const BULK_SETUP: u32 = 0x3c;
}

/// Raw access to the controller link
pub trait Transport: Send {
    /// Write `request`, then read the reply into `response`
    fn transaction(&mut self, request: &[u8], response: &mut [u8]) -> TransactionResult;

    /// Write a packet that produces no reply
    fn write(&mut self, packet: &[u8]) -> TransactionResult;

    /// Read whatever the controller streams next (acquisition buffers)
    fn read(&mut self, buffer: &mut [u8]) -> TransactionResult;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transaction(&mut self, request: &[u8], response: &mut [u8]) -> TransactionResult {
        (**self).transaction(request, response)
    }

    fn write(&mut self, packet: &[u8]) -> TransactionResult {
        (**self).write(packet)
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransactionResult {
        (**self).read(buffer)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }
}

/// Reply to an immediate list
#[must_use = "a transaction status must be checked"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReply {
    pub result: TransactionResult,
    pub data: Vec<u8>,
}

/// List-level operations available on every transport
pub trait TransportExt: Transport {
    /// Encode and execute a list, reporting the transport status as a value
    ///
    /// Encoding errors are returned before anything is sent.
    fn run_list(&mut self, list: &OperationList) -> std::result::Result<ListReply, ProtocolError> {
        let packet = codec::encode_immediate(list)?;
        let expected = codec::reply_size(list);

        if expected == 0 {
            let result = self.write(&packet);
            return Ok(ListReply {
                result,
                data: Vec::new(),
            });
        }

        let mut data = vec![0u8; expected];
        let result = self.transaction(&packet, &mut data);
        data.truncate(result.bytes);
        debug!(
            "Executed list: {} operations, {} reply bytes",
            list.len(),
            data.len()
        );
        Ok(ListReply { result, data })
    }

    /// Execute a list and return its reply bytes
    fn execute_list(&mut self, list: &OperationList) -> Result<Vec<u8>> {
        let reply = self.run_list(list)?;
        let address = list.iter().find_map(|op| op.address());
        reply
            .result
            .into_result()
            .map_err(|status| Error::transport("execute list", address, status))?;
        Ok(reply.data)
    }

    /// Store a list into stack memory
    fn load_list(&mut self, list: &OperationList, slot: StackSlot, offset: u16) -> Result<()> {
        let packet = codec::encode_stack(list, slot, offset)?;
        debug!(
            "Loading {} ({} operations, {} bytes) at offset {:#x}",
            slot,
            list.len(),
            packet.len(),
            offset
        );
        self.write(&packet)
            .into_result()
            .map_err(|status| Error::transport("load stack", None, status))?;
        Ok(())
    }

    fn write_action_register(&mut self, value: u16) -> Result<()> {
        let packet = codec::encode_action_register(value);
        self.write(&packet).into_result().map_err(|status| {
            warn!("Action register write {:#06x} failed: {}", value, status);
            Error::transport("action register write", None, status)
        })?;
        Ok(())
    }

    fn read_register(&mut self, register: u32) -> Result<u32> {
        let mut list = OperationList::new();
        list.add_register_read(register);
        let reply = self.execute_list(&list)?;
        let words = protocol::decode_reply(&reply, DataWidth::D32)?;
        words.first().copied().ok_or(Error::ShortReply {
            op: "register read",
            expected: 4,
            actual: reply.len(),
        })
    }

    fn write_register(&mut self, register: u32, value: u32) -> Result<()> {
        let mut list = OperationList::new();
        list.add_register_write(register, value);
        self.execute_list(&list)?;
        Ok(())
    }

    fn read_firmware_id(&mut self) -> Result<FirmwareId> {
        Ok(FirmwareId::from_register(
            self.read_register(FIRMWARE_ID_REGISTER)?,
        ))
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}
