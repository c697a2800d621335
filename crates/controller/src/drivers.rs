//! Device driver capabilities
//!
//! Drivers never build packets. They append operations to the readout list
//! the acquisition stack is built from, and run their setup and teardown
//! cycles on whatever transport the caller holds.
//!
//! A VME module implements [`Readable`] directly. A CAMAC module implements
//! [`CamacAddressable`] in terms of (N, A, F) and is wrapped in
//! [`CamacReadable`], which supplies the branch and crate context.

use crate::camac::{CrateController, DynCrateController};
use common::{Transport, TransportExt};
use protocol::camac::{self, CamacAddress, CamacWidth};
use protocol::{AddressModifier, DataWidth, OperationList, ProtocolError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A module that contributes to the triggered readout
pub trait Readable: Send {
    fn name(&self) -> &str;

    /// One-time setup before the run starts
    fn initialize(&mut self, transport: &mut dyn Transport) -> common::Result<()>;

    /// Append this module's readout operations
    fn add_readout_list(&self, list: &mut OperationList) -> Result<(), ProtocolError>;

    /// Teardown after the run stops
    fn on_end_run(&mut self, _transport: &mut dyn Transport) -> common::Result<()> {
        Ok(())
    }
}

/// One CAMAC read in a module's readout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CamacRead {
    #[serde(rename = "a")]
    pub subaddress: u8,
    #[serde(rename = "f")]
    pub function: u8,
    #[serde(default = "CamacRead::default_width")]
    pub width: CamacWidth,
}

impl CamacRead {
    fn default_width() -> CamacWidth {
        CamacWidth::Bits24
    }
}

/// A CAMAC module described by its station
pub trait CamacAddressable: Send {
    fn name(&self) -> &str;
    fn branch(&self) -> u8;
    fn crate_number(&self) -> u8;
    fn station(&self) -> u8;

    /// Setup cycles against the module's own crate
    fn initialize(&mut self, crate_: &mut DynCrateController<'_>) -> common::Result<()>;

    /// Reads performed on every trigger, in order
    fn readout(&self) -> Vec<CamacRead>;

    fn on_end_run(&mut self, _crate: &mut DynCrateController<'_>) -> common::Result<()> {
        Ok(())
    }
}

/// Adapts a [`CamacAddressable`] module to [`Readable`]
pub struct CamacReadable<D> {
    device: D,
}

impl<D: CamacAddressable> CamacReadable<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn crate_controller<'t>(
        &self,
        transport: &'t mut (dyn Transport + 't),
    ) -> Result<DynCrateController<'t>, ProtocolError> {
        CrateController::new(transport, self.device.branch(), self.device.crate_number())
    }
}

impl<D: CamacAddressable> Readable for CamacReadable<D> {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn initialize(&mut self, transport: &mut dyn Transport) -> common::Result<()> {
        let mut crate_ = self.crate_controller(transport)?;
        self.device.initialize(&mut crate_)
    }

    fn add_readout_list(&self, list: &mut OperationList) -> Result<(), ProtocolError> {
        for read in self.device.readout() {
            let addr = CamacAddress::new(
                self.device.branch(),
                self.device.crate_number(),
                self.device.station(),
                read.subaddress,
                read.function,
            )?;
            match read.width {
                CamacWidth::Bits16 => camac::add_camac_read16(list, &addr)?,
                CamacWidth::Bits24 => camac::add_camac_read24(list, &addr)?,
            }
        }
        Ok(())
    }

    fn on_end_run(&mut self, transport: &mut dyn Transport) -> common::Result<()> {
        let mut crate_ = self.crate_controller(transport)?;
        self.device.on_end_run(&mut crate_)
    }
}

/// A CAMAC cycle run during setup or teardown
///
/// The function class of `f` picks the primitive: writes send `datum`,
/// reads discard their data, control cycles ignore `datum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CamacCycle {
    pub a: u8,
    pub f: u8,
    #[serde(default)]
    pub datum: u32,
}

/// Generic CAMAC module described entirely by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CamacReadoutModule {
    pub name: String,
    #[serde(default)]
    pub branch: u8,
    #[serde(rename = "crate")]
    pub crate_number: u8,
    pub station: u8,
    #[serde(default)]
    pub init: Vec<CamacCycle>,
    #[serde(default)]
    pub readout: Vec<CamacRead>,
    #[serde(default)]
    pub end_run: Vec<CamacCycle>,
}

impl CamacReadoutModule {
    fn run_cycles(
        &self,
        stage: &'static str,
        cycles: &[CamacCycle],
        crate_: &mut DynCrateController<'_>,
    ) -> common::Result<()> {
        for cycle in cycles {
            let reply = crate_
                .execute(self.station, cycle.a, cycle.f, cycle.datum)?
                .into_result(stage)?;
            debug!(
                "{}: {} N{} A{} F{} {}",
                self.name, stage, self.station, cycle.a, cycle.f, reply.qx
            );
        }
        Ok(())
    }

    /// Every address this module uses, for validation
    pub fn addresses(&self) -> Result<Vec<CamacAddress>, ProtocolError> {
        let mut cnafs: Vec<(u8, u8)> = Vec::new();
        cnafs.extend(self.init.iter().map(|c| (c.a, c.f)));
        cnafs.extend(self.readout.iter().map(|r| (r.subaddress, r.function)));
        cnafs.extend(self.end_run.iter().map(|c| (c.a, c.f)));
        cnafs
            .into_iter()
            .map(|(a, f)| CamacAddress::new(self.branch, self.crate_number, self.station, a, f))
            .collect()
    }
}

impl CamacAddressable for CamacReadoutModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn branch(&self) -> u8 {
        self.branch
    }

    fn crate_number(&self) -> u8 {
        self.crate_number
    }

    fn station(&self) -> u8 {
        self.station
    }

    fn initialize(&mut self, crate_: &mut DynCrateController<'_>) -> common::Result<()> {
        info!(
            "Initializing CAMAC module {} at B{} C{} N{}",
            self.name, self.branch, self.crate_number, self.station
        );
        self.run_cycles("module init", &self.init, crate_)
    }

    fn readout(&self) -> Vec<CamacRead> {
        self.readout.clone()
    }

    fn on_end_run(&mut self, crate_: &mut DynCrateController<'_>) -> common::Result<()> {
        self.run_cycles("module end run", &self.end_run, crate_)
    }
}

/// One register write in a VME module's setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmeWrite {
    pub offset: u32,
    pub width: DataWidth,
    pub datum: u32,
}

/// One VME read in a module's readout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VmeRead {
    Single { offset: u32, width: DataWidth },
    Block { offset: u32, count: u32 },
    Fifo { offset: u32, count: u32 },
}

/// Generic VME module described entirely by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmeReadoutModule {
    pub name: String,
    pub base: u32,
    pub modifier: AddressModifier,
    /// Modifier for block and FIFO reads; defaults to `modifier`
    #[serde(default)]
    pub block_modifier: Option<AddressModifier>,
    /// Marker emitted ahead of this module's data
    #[serde(default)]
    pub marker: Option<u16>,
    #[serde(default)]
    pub init: Vec<VmeWrite>,
    #[serde(default)]
    pub readout: Vec<VmeRead>,
    #[serde(default)]
    pub end_run: Vec<VmeWrite>,
}

impl VmeReadoutModule {
    fn write_list(&self, writes: &[VmeWrite]) -> Result<OperationList, ProtocolError> {
        let mut list = OperationList::new();
        for write in writes {
            let address = self.base.wrapping_add(write.offset);
            let op = protocol::Operation::write(write.width, address, self.modifier, write.datum)?;
            list.append(op)?;
        }
        Ok(list)
    }

    fn run_writes(&self, transport: &mut dyn Transport, writes: &[VmeWrite]) -> common::Result<()> {
        let list = self.write_list(writes)?;
        if !list.is_empty() {
            transport.execute_list(&list)?;
        }
        Ok(())
    }
}

impl Readable for VmeReadoutModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, transport: &mut dyn Transport) -> common::Result<()> {
        info!(
            "Initializing VME module {} at {:#010x} am={}",
            self.name, self.base, self.modifier
        );
        self.run_writes(transport, &self.init)
    }

    fn add_readout_list(&self, list: &mut OperationList) -> Result<(), ProtocolError> {
        if let Some(marker) = self.marker {
            list.add_marker(marker);
        }
        let block_modifier = self.block_modifier.unwrap_or(self.modifier);
        for read in &self.readout {
            match *read {
                VmeRead::Single { offset, width } => {
                    let address = self.base.wrapping_add(offset);
                    list.append(protocol::Operation::read(width, address, self.modifier)?)?;
                }
                VmeRead::Block { offset, count } => {
                    list.add_block_read32(self.base.wrapping_add(offset), block_modifier, count)?
                }
                VmeRead::Fifo { offset, count } => {
                    list.add_fifo_read32(self.base.wrapping_add(offset), block_modifier, count)?
                }
            }
        }
        Ok(())
    }

    fn on_end_run(&mut self, transport: &mut dyn Transport) -> common::Result<()> {
        self.run_writes(transport, &self.end_run)
    }
}

/// Concatenate the readout of every module, in order
pub fn build_readout_list(modules: &[Box<dyn Readable>]) -> Result<OperationList, ProtocolError> {
    let mut list = OperationList::new();
    for module in modules {
        let mut part = OperationList::new();
        module.add_readout_list(&mut part)?;
        debug!("{}: {} readout operations", module.name(), part.len());
        list.append_list(&part);
    }
    Ok(list)
}
