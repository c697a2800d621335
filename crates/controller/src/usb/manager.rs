//! Controller discovery
//!
//! Enumerates the USB bus for VM-USB and CC-USB controllers and opens the
//! one selected by the configured filter.

use crate::usb::device::{ControllerDevice, ControllerInfo, ControllerKind, VENDOR_ID};
use crate::usb::transfers::UsbTransport;
use rusb::{Context, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which controllers to consider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    /// Restrict to one product id; `None` accepts both controller kinds
    pub product_id: Option<u16>,
    /// Serial number prefix, e.g. `VM0353`
    pub serial: Option<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: None,
            serial: None,
        }
    }
}

impl DeviceFilter {
    fn matches(&self, info: &ControllerInfo) -> bool {
        if let Some(product_id) = self.product_id
            && info.product_id != product_id
        {
            return false;
        }
        Self::check_serial(info.serial_number.as_deref(), self.serial.as_deref())
    }

    fn check_serial(serial: Option<&str>, filter: Option<&str>) -> bool {
        match (serial, filter) {
            (_, None) => true,
            (Some(serial), Some(filter)) => serial.starts_with(filter),
            (None, Some(_)) => false,
        }
    }
}

/// Controller enumeration over one libusb context
pub struct DeviceManager {
    context: Context,
    filter: DeviceFilter,
}

impl DeviceManager {
    pub fn new(filter: DeviceFilter) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            filter,
        })
    }

    /// All controllers on the bus that pass the filter
    pub fn enumerate(&self) -> Result<Vec<ControllerDevice>, rusb::Error> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            match ControllerDevice::identify(device, self.filter.vendor_id) {
                Ok(Some(controller)) => {
                    if self.filter.matches(&controller.info()) {
                        found.push(controller);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read device descriptor: {}", e),
            }
        }
        debug!("Enumerated {} controllers", found.len());
        Ok(found)
    }

    pub fn list(&self) -> Result<Vec<ControllerInfo>, rusb::Error> {
        Ok(self.enumerate()?.iter().map(ControllerDevice::info).collect())
    }

    /// Open the first matching controller
    pub fn open(&self, timeout: Duration) -> Result<UsbTransport, rusb::Error> {
        let controllers = self.enumerate()?;
        let Some(controller) = controllers.first() else {
            warn!("No controller matches {:?}", self.filter);
            return Err(rusb::Error::NotFound);
        };
        if controllers.len() > 1 {
            warn!(
                "{} controllers match, using the first; set a serial filter to choose",
                controllers.len()
            );
        }
        let transport = controller.open(timeout)?;
        info!("Opened {}", controller.info());
        if controller.kind() == ControllerKind::CcUsb {
            debug!("CC-USB controller: VME operations are unavailable");
        }
        Ok(transport)
    }
}
