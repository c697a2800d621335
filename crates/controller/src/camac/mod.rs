//! CAMAC access through a branch driver
//!
//! [`CrateController`] issues single CAMAC cycles with their Q/X test;
//! [`BranchDriver`] brings branches and crates on line.

pub mod branch;
pub mod crate_controller;

pub use branch::{BranchDriver, BranchTiming};
pub use crate_controller::{CamacReply, CrateController, DynCrateController};
