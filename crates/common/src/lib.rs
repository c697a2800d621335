//! Shared runtime pieces for vmusb-rs
//!
//! This crate sits between the pure `protocol` crate and the hardware-facing
//! controller: the [`Transport`] seam and its list-level helpers, the
//! [`ResourceArbiter`] that serializes acquisition and control access, the
//! async channel bridge to the acquisition thread, logging and errors.

pub mod arbiter;
pub mod channel;
pub mod context;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod transport;

pub use arbiter::{AcquisitionSession, ArbitrationToken, ControlGuard, ResourceArbiter};
pub use channel::{
    AcquisitionBridge, AcquisitionCommand, AcquisitionEvent, AcquisitionLink,
    create_acquisition_bridge,
};
pub use context::{RunContext, RunState};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use transport::{DEFAULT_TIMEOUT, ListReply, Transport, TransportExt, action, register};
