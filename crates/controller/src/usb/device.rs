//! Controller device abstraction
//!
//! Wraps a discovered rusb device with its cached descriptor and knows how to
//! open it as a [`UsbTransport`].

use crate::usb::transfers::UsbTransport;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Wiener/JTec vendor id
pub const VENDOR_ID: u16 = 0x16dc;
/// VM-USB VME controller
pub const VMUSB_PRODUCT_ID: u16 = 0x000b;
/// CC-USB CAMAC controller
pub const CCUSB_PRODUCT_ID: u16 = 0x0001;

/// Interface carrying the bulk endpoints
pub const INTERFACE: u8 = 0;

/// Kind of controller behind a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerKind {
    VmUsb,
    CcUsb,
}

impl ControllerKind {
    pub fn from_product_id(product_id: u16) -> Option<Self> {
        match product_id {
            VMUSB_PRODUCT_ID => Some(Self::VmUsb),
            CCUSB_PRODUCT_ID => Some(Self::CcUsb),
            _ => None,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmUsb => f.write_str("VM-USB"),
            Self::CcUsb => f.write_str("CC-USB"),
        }
    }
}

/// Identification of a discovered controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerInfo {
    pub kind: ControllerKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub serial_number: Option<String>,
}

impl fmt::Display for ControllerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x} bus {} address {}",
            self.kind, self.vendor_id, self.product_id, self.bus_number, self.device_address
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// A controller found during enumeration
pub struct ControllerDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    kind: ControllerKind,
}

impl ControllerDevice {
    /// Wrap `device` if it is a supported controller from `vendor_id`
    pub fn identify(device: Device<Context>, vendor_id: u16) -> Result<Option<Self>, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        if descriptor.vendor_id() != vendor_id {
            return Ok(None);
        }
        let Some(kind) = ControllerKind::from_product_id(descriptor.product_id()) else {
            return Ok(None);
        };
        Ok(Some(Self {
            device,
            descriptor,
            kind,
        }))
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Describe the device, reading the serial string if the device can be opened
    pub fn info(&self) -> ControllerInfo {
        let serial_number = self.device.open().ok().and_then(|handle| {
            self.descriptor
                .serial_number_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        });

        ControllerInfo {
            kind: self.kind,
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bus_number: self.device.bus_number(),
            device_address: self.device.address(),
            serial_number,
        }
    }

    /// Open the device and claim its bulk interface
    pub fn open(&self, timeout: Duration) -> Result<UsbTransport, rusb::Error> {
        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open {}: {}", self.kind, e);
            e
        })?;
        claim(&handle)?;
        debug!(
            "Opened {} on bus {} address {}",
            self.kind,
            self.device.bus_number(),
            self.device.address()
        );
        Ok(UsbTransport::new(handle, self.kind, timeout))
    }
}

fn claim(handle: &DeviceHandle<Context>) -> Result<(), rusb::Error> {
    match handle.kernel_driver_active(INTERFACE) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", INTERFACE);
            if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    INTERFACE, e
                );
            }
        }
        Ok(false) => {}
        Err(e) => debug!(
            "Could not check kernel driver status for interface {}: {}",
            INTERFACE, e
        ),
    }

    handle.claim_interface(INTERFACE).map_err(|e| {
        warn!("Failed to claim interface {}: {}", INTERFACE, e);
        e
    })
}
