//! Bulk transfer transport
//!
//! Implements [`Transport`] over the controller's bulk endpoints. Errors are
//! reported as [`TransactionResult`] values and never retried here.

use crate::usb::device::{ControllerKind, INTERFACE};
use common::Transport;
use protocol::{TransactionResult, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Bulk OUT endpoint
pub const ENDPOINT_OUT: u8 = 0x02;
/// Bulk IN endpoint
pub const ENDPOINT_IN: u8 = 0x86;

/// An opened controller
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    kind: ControllerKind,
    timeout: Duration,
}

impl UsbTransport {
    pub(crate) fn new(handle: DeviceHandle<Context>, kind: ControllerKind, timeout: Duration) -> Self {
        Self {
            handle,
            kind,
            timeout,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn write_bulk(&self, packet: &[u8]) -> Result<usize, UsbError> {
        let written = self
            .handle
            .write_bulk(ENDPOINT_OUT, packet, self.timeout)
            .map_err(map_rusb_error)?;
        if written != packet.len() {
            return Err(UsbError::Other {
                message: format!("short write: {} of {} bytes", written, packet.len()),
            });
        }
        Ok(written)
    }
}

impl Transport for UsbTransport {
    fn transaction(&mut self, request: &[u8], response: &mut [u8]) -> TransactionResult {
        if let Err(e) = self.write_bulk(request) {
            warn!("Bulk write of {} bytes failed: {}", request.len(), e);
            return TransactionResult::write_failed(e);
        }
        match self.handle.read_bulk(ENDPOINT_IN, response, self.timeout) {
            Ok(len) => {
                debug!("Transaction: {} bytes out, {} bytes in", request.len(), len);
                TransactionResult::ok(len)
            }
            Err(e) => {
                warn!("Bulk read after {}-byte request failed: {}", request.len(), e);
                TransactionResult::read_failed(map_rusb_error(e))
            }
        }
    }

    fn write(&mut self, packet: &[u8]) -> TransactionResult {
        match self.write_bulk(packet) {
            Ok(len) => {
                debug!("Wrote {} bytes", len);
                TransactionResult::ok(len)
            }
            Err(e) => {
                warn!("Bulk write of {} bytes failed: {}", packet.len(), e);
                TransactionResult::write_failed(e)
            }
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransactionResult {
        match self.handle.read_bulk(ENDPOINT_IN, buffer, self.timeout) {
            Ok(len) => TransactionResult::ok(len),
            // No buffer ready is routine while acquiring
            Err(rusb::Error::Timeout) => TransactionResult::read_failed(UsbError::Timeout),
            Err(e) => {
                warn!("Bulk read failed: {}", e);
                TransactionResult::read_failed(map_rusb_error(e))
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            debug!("Failed to release interface {}: {}", INTERFACE, e);
        }
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
