//! Controller configuration management

use crate::acquisition::AcquisitionSettings;
use crate::drivers::{CamacReadoutModule, VmeReadoutModule};
use crate::usb::{DeviceFilter, device::VENDOR_ID};
use anyhow::{Context, Result, anyhow};
use protocol::{CamacAddress, StackSlot};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller: ControllerSettings,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Branches and crates brought on line at startup
    #[serde(default)]
    pub branches: Vec<BranchConfig>,
    #[serde(default)]
    pub camac_modules: Vec<CamacReadoutModule>,
    #[serde(default)]
    pub vme_modules: Vec<VmeReadoutModule>,
    #[serde(default)]
    pub control: ControlSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub log_level: String,
    /// Serial number prefix selecting one controller
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "ControllerSettings::default_vendor_id")]
    pub vendor_id: u16,
    /// Restrict to one product id (0x000b VM-USB, 0x0001 CC-USB)
    #[serde(default)]
    pub product_id: Option<u16>,
    /// Timeout of control-path transactions in milliseconds
    #[serde(default = "ControllerSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub service_mode: bool,
}

impl ControllerSettings {
    fn default_vendor_id() -> u16 {
        VENDOR_ID
    }

    fn default_timeout_ms() -> u64 {
        2000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial: self.serial.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Start acquisition after bring-up
    #[serde(default = "AcquisitionConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AcquisitionConfig::default_stack_slot")]
    pub stack_slot: u8,
    #[serde(default)]
    pub load_offset: u16,
    #[serde(default = "AcquisitionConfig::default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "AcquisitionConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            stack_slot: Self::default_stack_slot(),
            load_offset: 0,
            buffer_size: Self::default_buffer_size(),
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

impl AcquisitionConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_stack_slot() -> u8 {
        2 // first trigger-driven stack
    }

    fn default_buffer_size() -> usize {
        13 * 1024 * 2
    }

    fn default_read_timeout_ms() -> u64 {
        100
    }

    pub fn settings(&self) -> Result<AcquisitionSettings> {
        Ok(AcquisitionSettings {
            slot: StackSlot::new(self.stack_slot)?,
            offset: self.load_offset,
            buffer_size: self.buffer_size,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub branch: u8,
    #[serde(default)]
    pub crates: Vec<u8>,
    /// Seconds to wait after the branch reset
    #[serde(default = "BranchConfig::default_settle_secs")]
    pub settle_secs: u64,
    /// Seconds between polls of an offline crate
    #[serde(default = "BranchConfig::default_retry_secs")]
    pub retry_secs: u64,
}

impl BranchConfig {
    fn default_settle_secs() -> u64 {
        3
    }

    fn default_retry_secs() -> u64 {
        1
    }
}

/// A CNAF polled on the control path while acquisition runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorPoint {
    #[serde(default)]
    pub branch: u8,
    #[serde(rename = "crate")]
    pub crate_number: u8,
    pub n: u8,
    pub a: u8,
    pub f: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Seconds between monitor polls; 0 disables polling
    #[serde(default = "ControlSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub monitor: Vec<MonitorPoint>,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: Self::default_poll_interval(),
            monitor: Vec::new(),
        }
    }
}

impl ControlSettings {
    fn default_poll_interval() -> u64 {
        10
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller: ControllerSettings {
                log_level: "info".to_string(),
                serial: None,
                vendor_id: VENDOR_ID,
                product_id: None,
                timeout_ms: ControllerSettings::default_timeout_ms(),
                service_mode: false,
            },
            acquisition: AcquisitionConfig::default(),
            branches: Vec::new(),
            camac_modules: Vec::new(),
            vme_modules: Vec::new(),
            control: ControlSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/vmusb/controller.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ControllerConfig = toml::from_str(content).context("Failed to parse")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vmusb").join("controller.toml")
        } else {
            PathBuf::from(".config/vmusb/controller.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.controller.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.controller.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.controller.timeout_ms == 0 {
            return Err(anyhow!("controller.timeout_ms must be greater than 0"));
        }

        StackSlot::new(self.acquisition.stack_slot)
            .map_err(|e| anyhow!("Invalid acquisition.stack_slot: {}", e))?;
        if self.acquisition.buffer_size < 2 {
            return Err(anyhow!("acquisition.buffer_size must hold a buffer header"));
        }

        for branch in &self.branches {
            for crate_number in &branch.crates {
                CamacAddress::new(branch.branch, *crate_number, 0, 0, 0).map_err(|e| {
                    anyhow!(
                        "Invalid branch {} crate {}: {}",
                        branch.branch,
                        crate_number,
                        e
                    )
                })?;
            }
        }

        for module in &self.camac_modules {
            module
                .addresses()
                .map_err(|e| anyhow!("Invalid CAMAC module '{}': {}", module.name, e))?;
        }

        for module in &self.vme_modules {
            if module.name.is_empty() {
                return Err(anyhow!("VME module at {:#010x} has no name", module.base));
            }
        }

        for point in &self.control.monitor {
            CamacAddress::new(point.branch, point.crate_number, point.n, point.a, point.f)
                .map_err(|e| anyhow!("Invalid monitor point: {}", e))?;
        }

        Ok(())
    }
}
