//! Hardware side of vmusb-rs
//!
//! Opens VM-USB and CC-USB controllers over rusb, provides CAMAC crate and
//! branch control on top of the shared transport, runs the acquisition
//! worker, and loads the TOML configuration the `vmusb-ctl` binary uses.

pub mod acquisition;
pub mod camac;
pub mod config;
pub mod control;
pub mod drivers;
pub mod usb;

pub use acquisition::{AcquisitionSettings, AcquisitionWorker, RunStatistics, spawn_acquisition};
pub use camac::{BranchDriver, BranchTiming, CamacReply, CrateController};
pub use config::ControllerConfig;
pub use drivers::{CamacAddressable, CamacReadable, Readable};
