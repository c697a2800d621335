//! Integration tests for configuration parsing
//!
//! Covers a complete controller file, the defaults applied to a minimal one,
//! and rejection of invalid addresses and settings.

use controller::config::ControllerConfig;
use controller::drivers::{CamacRead, VmeRead};
use protocol::camac::CamacWidth;
use protocol::{AddressModifier, DataWidth};
use std::io::Write;
use std::time::Duration;

const MINIMAL_CONFIG: &str = r#"
[controller]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[controller]
log_level = "debug"
serial = "VM0"
product_id = 0x000b
timeout_ms = 500
service_mode = true

[acquisition]
enabled = true
stack_slot = 3
load_offset = 0x100
buffer_size = 4096
read_timeout_ms = 50

[[branches]]
branch = 0
crates = [1, 2]
settle_secs = 1
retry_secs = 2

[[camac_modules]]
name = "adc"
crate = 1
station = 5
init = [{ a = 0, f = 9 }, { a = 1, f = 16, datum = 0x7ff }]
readout = [{ a = 0, f = 0 }, { a = 1, f = 0, width = "16" }]
end_run = [{ a = 0, f = 24 }]

[[vme_modules]]
name = "tdc"
base = 0x00100000
modifier = "a32_user_data"
block_modifier = "a32_user_block"
marker = 0xfeed
init = [{ offset = 0x1000, width = "D16", datum = 1 }]
readout = [
    { kind = "single", offset = 0x2000, width = "D32" },
    { kind = "block", offset = 0x0, count = 64 },
]

[control]
poll_interval_secs = 5

[[control.monitor]]
crate = 1
n = 5
a = 2
f = 0
"#;

#[test]
fn test_minimal_config_defaults() {
    let config = ControllerConfig::from_toml(MINIMAL_CONFIG).unwrap();
    assert_eq!(config.controller.vendor_id, 0x16dc);
    assert_eq!(config.controller.timeout(), Duration::from_secs(2));
    assert!(config.controller.product_id.is_none());
    assert_eq!(config.acquisition.stack_slot, 2);
    assert_eq!(config.acquisition.read_timeout_ms, 100);
    assert!(config.branches.is_empty());
    assert_eq!(config.control.poll_interval_secs, 10);
}

#[test]
fn test_full_config() {
    let config = ControllerConfig::from_toml(FULL_CONFIG).unwrap();

    assert!(config.controller.service_mode);
    let filter = config.controller.device_filter();
    assert_eq!(filter.product_id, Some(0x000b));
    assert_eq!(filter.serial.as_deref(), Some("VM0"));

    let settings = config.acquisition.settings().unwrap();
    assert_eq!(settings.slot.number(), 3);
    assert_eq!(settings.offset, 0x100);
    assert_eq!(settings.read_timeout, Duration::from_millis(50));

    assert_eq!(config.branches[0].crates, vec![1, 2]);

    let adc = &config.camac_modules[0];
    assert_eq!(adc.branch, 0);
    assert_eq!(adc.init[1].datum, 0x7ff);
    assert_eq!(
        adc.readout[1],
        CamacRead {
            subaddress: 1,
            function: 0,
            width: CamacWidth::Bits16
        }
    );
    assert_eq!(adc.readout[0].width, CamacWidth::Bits24);

    let tdc = &config.vme_modules[0];
    assert_eq!(tdc.modifier, AddressModifier::A32UserData);
    assert_eq!(tdc.block_modifier, Some(AddressModifier::A32UserBlock));
    assert_eq!(tdc.init[0].width, DataWidth::D16);
    assert_eq!(
        tdc.readout[1],
        VmeRead::Block {
            offset: 0,
            count: 64
        }
    );

    assert_eq!(config.control.monitor.len(), 1);
    assert_eq!(config.control.monitor[0].n, 5);
}

#[test]
fn test_rejects_bad_station() {
    let content = FULL_CONFIG.replace("station = 5", "station = 32");
    let err = ControllerConfig::from_toml(&content).unwrap_err();
    assert!(format!("{:#}", err).contains("adc"));
}

#[test]
fn test_rejects_function_out_of_range() {
    let content = FULL_CONFIG.replace("f = 24", "f = 40");
    assert!(ControllerConfig::from_toml(&content).is_err());
}

#[test]
fn test_rejects_zero_timeout() {
    let content = MINIMAL_CONFIG.to_string() + "timeout_ms = 0\n";
    assert!(ControllerConfig::from_toml(&content).is_err());
}

#[test]
fn test_rejects_unknown_modifier() {
    let content = FULL_CONFIG.replace("\"a32_user_data\"", "\"a64\"");
    assert!(ControllerConfig::from_toml(&content).is_err());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();

    let config = ControllerConfig::load(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config.controller.log_level, "debug");
    assert_eq!(config.camac_modules.len(), 1);
}

#[test]
fn test_save_creates_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("controller.toml");

    let config = ControllerConfig::from_toml(FULL_CONFIG).unwrap();
    config.save(&path).unwrap();

    let loaded = ControllerConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ControllerConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}
