//! Single-shot CAMAC primitives
//!
//! Each primitive resolves the packed address, runs the data cycle as an
//! immediate list, then runs its own Q/X test cycle against the branch
//! driver's status register. Q/X is only valid for the primitive that
//! returned it.

use common::{Transport, TransportExt};
use protocol::camac::{self, CSR_SUBADDRESS, CamacAddress, FunctionClass, QxStatus};
use protocol::{
    DataWidth, OperationList, ProtocolError, TransactionResult, TransactionStatus, UsbError,
    decode_reply,
};
use tracing::{debug, warn};

/// Outcome of a CAMAC primitive
///
/// Transport failures are reported here, not as `Err`; `qx` is all false
/// whenever `status` is not ok.
#[must_use = "a CAMAC transaction status must be checked"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CamacReply {
    pub status: TransactionStatus,
    /// Packed address of the data cycle
    pub address: u32,
    /// Read data; zero for writes and control cycles
    pub data: u32,
    pub qx: QxStatus,
}

impl CamacReply {
    fn failed(address: u32, status: TransactionStatus) -> Self {
        Self {
            status,
            address,
            data: 0,
            qx: QxStatus::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn q(&self) -> bool {
        self.qx.q
    }

    pub fn x(&self) -> bool {
        self.qx.x
    }

    /// Turn a failed status into an error carrying `op` and the address
    pub fn into_result(self, op: &'static str) -> common::Result<Self> {
        if self.status.is_ok() {
            Ok(self)
        } else {
            Err(common::Error::transport(op, Some(self.address), self.status))
        }
    }
}

/// CAMAC access to one crate of one branch
pub struct CrateController<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    branch: u8,
    crate_number: u8,
}

/// Crate controller over a type-erased transport, as handed to device drivers
pub type DynCrateController<'a> = CrateController<'a, dyn Transport + 'a>;

impl<'a, T: Transport + ?Sized> CrateController<'a, T> {
    pub fn new(transport: &'a mut T, branch: u8, crate_number: u8) -> Result<Self, ProtocolError> {
        CamacAddress::new(branch, crate_number, 0, 0, 0)?;
        Ok(Self {
            transport,
            branch,
            crate_number,
        })
    }

    pub fn branch(&self) -> u8 {
        self.branch
    }

    pub fn crate_number(&self) -> u8 {
        self.crate_number
    }

    fn address(&self, n: u8, a: u8, f: u8) -> Result<CamacAddress, ProtocolError> {
        CamacAddress::new(self.branch, self.crate_number, n, a, f)
    }

    pub fn write16(&mut self, n: u8, a: u8, f: u8, datum: u16) -> Result<CamacReply, ProtocolError> {
        let addr = self.address(n, a, f)?;
        let mut list = OperationList::new();
        camac::add_camac_write16(&mut list, &addr, datum)?;
        self.cycle("camac write16", &addr, &list, Assemble::None)
    }

    /// 24-bit write, split into high byte and low word with a settle delay
    pub fn write24(&mut self, n: u8, a: u8, f: u8, datum: u32) -> Result<CamacReply, ProtocolError> {
        let addr = self.address(n, a, f)?;
        let mut list = OperationList::new();
        camac::add_camac_write24(&mut list, &addr, datum)?;
        self.cycle("camac write24", &addr, &list, Assemble::None)
    }

    pub fn read16(&mut self, n: u8, a: u8, f: u8) -> Result<CamacReply, ProtocolError> {
        let addr = self.address(n, a, f)?;
        let mut list = OperationList::new();
        camac::add_camac_read16(&mut list, &addr)?;
        self.cycle("camac read16", &addr, &list, Assemble::Low16)
    }

    /// 24-bit read, assembled from the high byte and low word
    pub fn read24(&mut self, n: u8, a: u8, f: u8) -> Result<CamacReply, ProtocolError> {
        let addr = self.address(n, a, f)?;
        let mut list = OperationList::new();
        camac::add_camac_read24(&mut list, &addr)?;
        self.cycle("camac read24", &addr, &list, Assemble::Split24)
    }

    /// Dataless control cycle (F8-F15, F24-F31)
    pub fn control(&mut self, n: u8, a: u8, f: u8) -> Result<CamacReply, ProtocolError> {
        let addr = self.address(n, a, f)?;
        let mut list = OperationList::new();
        camac::add_camac_control(&mut list, &addr)?;
        self.cycle("camac control", &addr, &list, Assemble::None)
    }

    /// Run a primitive chosen by the function class of `f`
    ///
    /// Writes send the low 24 bits of `datum`; reads return 24-bit data.
    pub fn execute(&mut self, n: u8, a: u8, f: u8, datum: u32) -> Result<CamacReply, ProtocolError> {
        match FunctionClass::of(f) {
            FunctionClass::Read => self.read24(n, a, f),
            FunctionClass::Write => self.write24(n, a, f, datum & 0x00ff_ffff),
            FunctionClass::Control => self.control(n, a, f),
        }
    }

    fn cycle(
        &mut self,
        op: &'static str,
        addr: &CamacAddress,
        list: &OperationList,
        assemble: Assemble,
    ) -> Result<CamacReply, ProtocolError> {
        let packed = addr.pack(camac::CamacWidth::Bits16).word();
        let reply = self.transport.run_list(list)?;
        let data = match check(reply.result, &reply.data, assemble.reply_bytes())
            .and_then(|()| assemble.apply(&reply.data).map_err(protocol_status))
        {
            Ok(data) => data,
            Err(status) => {
                warn!("{} {} failed: {}", op, addr, status);
                return Ok(CamacReply::failed(packed, status));
            }
        };

        let qx = match self.test_qx() {
            Ok(qx) => qx,
            Err(status) => {
                warn!("Q/X test after {} {} failed: {}", op, addr, status);
                return Ok(CamacReply::failed(packed, status));
            }
        };

        debug!("{} {} -> data={:#x} {}", op, addr, data, qx);
        Ok(CamacReply {
            status: TransactionStatus::Ok,
            address: packed,
            data,
            qx,
        })
    }

    /// Read the branch driver CSR and extract Q and X
    fn test_qx(&mut self) -> Result<QxStatus, TransactionStatus> {
        let csr = camac::bridge_register(self.branch, CSR_SUBADDRESS, 0).map_err(protocol_status)?;
        let mut list = OperationList::new();
        camac::add_camac_read16(&mut list, &csr).map_err(protocol_status)?;
        let reply = self.transport.run_list(&list).map_err(protocol_status)?;
        check(reply.result, &reply.data, 2)?;
        let value = Assemble::Low16.apply(&reply.data).map_err(protocol_status)?;
        Ok(QxStatus::from_csr(value))
    }
}

/// How the reply bytes of a data cycle become the returned datum
#[derive(Clone, Copy)]
enum Assemble {
    None,
    Low16,
    Split24,
}

impl Assemble {
    fn reply_bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::Low16 => 2,
            Self::Split24 => 4,
        }
    }

    fn apply(self, reply: &[u8]) -> Result<u32, ProtocolError> {
        if matches!(self, Self::None) {
            return Ok(0);
        }
        let words = decode_reply(reply, DataWidth::D16)?;
        Ok(match (self, words.as_slice()) {
            (Self::Split24, [high, low, ..]) => ((high & 0xff) << 16) | (low & 0xffff),
            (_, [low, ..]) => low & 0xffff,
            _ => 0,
        })
    }
}

fn check(result: TransactionResult, data: &[u8], expected: usize) -> Result<(), TransactionStatus> {
    result.into_result()?;
    if data.len() < expected {
        return Err(TransactionStatus::ReadFailed(UsbError::Other {
            message: format!("short reply: {} of {} bytes", data.len(), expected),
        }));
    }
    Ok(())
}

fn protocol_status(e: ProtocolError) -> TransactionStatus {
    TransactionStatus::ReadFailed(UsbError::Other {
        message: e.to_string(),
    })
}
