//! Branch and crate bring-up

use crate::camac::crate_controller::{CamacReply, CrateController};
use common::{Error, Result, Transport};
use protocol::camac::{BRIDGE_CRATE, BRIDGE_STATION, BTB_SUBADDRESS, CSR_SUBADDRESS, IFR_SUBADDRESS};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interrupt/timeout mask written on branch reset: all sources masked
pub const SAFE_INTERRUPT_MASK: u16 = 0x0000;

/// Crate controller station
pub const CRATE_CONTROLLER_STATION: u8 = 28;
/// Station addressing the crate inhibit line
pub const INHIBIT_STATION: u8 = 30;

/// Sleep intervals used during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTiming {
    /// Pause after a branch-wide reset
    pub settle: Duration,
    /// Pause between polls of an offline crate
    pub retry: Duration,
}

impl Default for BranchTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            retry: Duration::from_secs(1),
        }
    }
}

/// Bring-up operations for one branch
pub struct BranchDriver<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    branch: u8,
    timing: BranchTiming,
}

impl<'a, T: Transport + ?Sized> BranchDriver<'a, T> {
    pub fn new(transport: &'a mut T, branch: u8) -> Self {
        Self::with_timing(transport, branch, BranchTiming::default())
    }

    pub fn with_timing(transport: &'a mut T, branch: u8, timing: BranchTiming) -> Self {
        Self {
            transport,
            branch,
            timing,
        }
    }

    pub fn branch(&self) -> u8 {
        self.branch
    }

    fn crate_controller(&mut self, crate_number: u8) -> Result<CrateController<'_, T>> {
        Ok(CrateController::new(
            &mut *self.transport,
            self.branch,
            crate_number,
        )?)
    }

    fn bridge(&mut self) -> Result<CrateController<'_, T>> {
        self.crate_controller(BRIDGE_CRATE)
    }

    /// Reset the branch driver's interrupt mask, clear pending sources and settle
    pub fn initialize_branch(&mut self) -> Result<()> {
        info!("Initializing branch {}", self.branch);
        let mut bridge = self.bridge()?;
        bridge
            .write16(BRIDGE_STATION, IFR_SUBADDRESS, 16, SAFE_INTERRUPT_MASK)?
            .into_result("branch interrupt mask write")?;
        // F9 clears the CSR's pending interrupt and timeout flags
        bridge
            .control(BRIDGE_STATION, CSR_SUBADDRESS, 9)?
            .into_result("branch clear")?;

        debug!(
            "Branch {} settling for {:?}",
            self.branch, self.timing.settle
        );
        thread::sleep(self.timing.settle);
        Ok(())
    }

    /// One poll of the branch-test register
    pub fn crate_online(&mut self, crate_number: u8) -> Result<bool> {
        if crate_number >= 8 {
            return Err(Error::Protocol(protocol::ProtocolError::InvalidAddress {
                field: "crate",
                value: u32::from(crate_number),
                limit: 8,
            }));
        }
        let reply = self
            .bridge()?
            .read16(BRIDGE_STATION, BTB_SUBADDRESS, 0)?
            .into_result("branch test read")?;
        Ok(reply.data & (1 << crate_number) != 0)
    }

    /// Wait for `crate_number` to come on line, then clear it and remove inhibit
    ///
    /// Polls without a time limit; an offline crate is logged on every poll.
    pub fn initialize_crate(&mut self, crate_number: u8) -> Result<()> {
        let mut polls = 0u64;
        while !self.crate_online(crate_number)? {
            polls += 1;
            warn!(
                "Branch {} crate {} offline (poll {}), retrying in {:?}",
                self.branch, crate_number, polls, self.timing.retry
            );
            thread::sleep(self.timing.retry);
        }
        info!("Branch {} crate {} online", self.branch, crate_number);

        self.c_crate(crate_number)?;
        self.remove_inhibit(crate_number)?;
        Ok(())
    }

    /// Dataway initialize (Z): N28 A8 F26
    pub fn z_crate(&mut self, crate_number: u8) -> Result<CamacReply> {
        self.crate_controller(crate_number)?
            .control(CRATE_CONTROLLER_STATION, 8, 26)?
            .into_result("dataway initialize")
    }

    /// Dataway clear (C): N28 A9 F26
    pub fn c_crate(&mut self, crate_number: u8) -> Result<CamacReply> {
        self.crate_controller(crate_number)?
            .control(CRATE_CONTROLLER_STATION, 9, 26)?
            .into_result("dataway clear")
    }

    /// Remove inhibit: N30 A9 F24
    pub fn remove_inhibit(&mut self, crate_number: u8) -> Result<CamacReply> {
        self.crate_controller(crate_number)?
            .control(INHIBIT_STATION, 9, 24)?
            .into_result("remove inhibit")
    }
}
