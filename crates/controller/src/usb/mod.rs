//! USB subsystem
//!
//! Discovers controllers, opens them, and exposes the bulk endpoints as a
//! [`common::Transport`].

pub mod device;
pub mod manager;
pub mod transfers;

pub use device::{ControllerDevice, ControllerInfo, ControllerKind};
pub use manager::{DeviceFilter, DeviceManager};
pub use transfers::{UsbTransport, map_rusb_error};
