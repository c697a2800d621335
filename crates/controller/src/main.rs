//! vmusb-ctl
//!
//! Brings a VM-USB or CC-USB controller and its CAMAC branches on line,
//! loads the readout stack built from the configured modules, and runs
//! acquisition until interrupted, polling monitor points in between.

mod service;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{
    AcquisitionBridge, AcquisitionCommand, AcquisitionEvent, RunContext, TransportExt,
    create_acquisition_bridge, setup_logging,
};
use controller::config::{ControllerConfig, MonitorPoint};
use controller::drivers::{CamacReadable, Readable, VmeReadoutModule, build_readout_list};
use controller::usb::{DeviceManager, UsbTransport};
use controller::{AcquisitionWorker, control, spawn_acquisition};
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "vmusb-ctl")]
#[command(
    author,
    version,
    about = "vmusb-ctl - VME/CAMAC data acquisition through a USB bus controller"
)]
#[command(long_about = "
Drives a Wiener VM-USB or CC-USB controller: brings CAMAC branches and crates
on line, initializes the configured modules, loads the readout stack and
acquires until Ctrl-C.

EXAMPLES:
    # Run with default config
    vmusb-ctl

    # Run with custom config
    vmusb-ctl --config /path/to/controller.toml

    # List attached controllers
    vmusb-ctl --list-devices --json

    # Run under systemd
    vmusb-ctl --service

CONFIGURATION:
    The controller looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vmusb/controller.toml
    3. /etc/vmusb/controller.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run headless and notify systemd
    #[arg(long)]
    service: bool,

    /// List controllers and exit
    #[arg(long)]
    list_devices: bool,

    /// Print --list-devices output as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ControllerConfig::default();
        let path = ControllerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ControllerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ControllerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.controller.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("vmusb-ctl v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config, args.json).await;
    }

    let service_mode = args.service || config.controller.service_mode;
    if service_mode {
        info!("Running in service mode (headless)");
        if service::is_systemd() {
            info!("Running under systemd");
        }
    }

    let result = run(config).await;
    if service_mode {
        service::notify_stopping().context("Failed to notify systemd stopping")?;
    }
    result
}

/// List controllers and exit
async fn list_devices_mode(config: &ControllerConfig, json: bool) -> Result<()> {
    let filter = config.controller.device_filter();
    let timeout = config.controller.timeout();

    let controllers = tokio::task::spawn_blocking(move || -> Result<Vec<_>> {
        let manager = DeviceManager::new(filter).context("Failed to create USB context")?;
        let mut found = Vec::new();
        for device in manager.enumerate().context("Failed to enumerate USB devices")? {
            let firmware = device
                .open(timeout)
                .ok()
                .and_then(|mut transport| transport.read_firmware_id().ok());
            found.push((device.info(), firmware));
        }
        Ok(found)
    })
    .await
    .context("Device enumeration task failed")??;

    if json {
        let entries: Vec<_> = controllers
            .iter()
            .map(|(info, firmware)| {
                serde_json::json!({
                    "controller": info,
                    "firmware": firmware.map(|f| f.to_string()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if controllers.is_empty() {
        println!("No controllers found.");
    } else {
        println!("Found {} controller(s):\n", controllers.len());
        for (info, firmware) in controllers {
            println!("  {}", info);
            match firmware {
                Some(firmware) => println!("      Firmware: {}", firmware),
                None => println!("      Firmware: unavailable (device busy or no access)"),
            }
            println!();
        }
    }
    Ok(())
}

fn open_controller(config: &ControllerConfig) -> Result<UsbTransport> {
    let manager =
        DeviceManager::new(config.controller.device_filter()).context("Failed to create USB context")?;
    let mut transport = manager
        .open(config.controller.timeout())
        .context("Failed to open controller")?;
    let firmware = transport
        .read_firmware_id()
        .context("Failed to read firmware id")?;
    info!("Controller firmware {}", firmware);
    Ok(transport)
}

fn build_modules(config: &ControllerConfig) -> Vec<Box<dyn Readable>> {
    let mut modules: Vec<Box<dyn Readable>> = Vec::new();
    for module in &config.camac_modules {
        modules.push(Box::new(CamacReadable::new(module.clone())));
    }
    for module in &config.vme_modules {
        modules.push(Box::<VmeReadoutModule>::new(module.clone()));
    }
    modules
}

async fn run(config: ControllerConfig) -> Result<()> {
    let transport = tokio::task::spawn_blocking({
        let config = config.clone();
        move || open_controller(&config)
    })
    .await
    .context("Controller open task failed")??;
    let context = RunContext::new(transport);

    info!("Bringing up {} branches", config.branches.len());
    let modules = tokio::task::spawn_blocking({
        let context = context.clone();
        let branches = config.branches.clone();
        let mut modules = build_modules(&config);
        move || -> Result<Vec<Box<dyn Readable>>> {
            control::bring_up(context.arbiter(), &branches, &mut modules)?;
            Ok(modules)
        }
    })
    .await
    .context("Bring-up task failed")??;

    let readout = build_readout_list(&modules).context("Failed to build readout list")?;
    info!(
        "Readout list: {} operations, {} words",
        readout.len(),
        readout.size()
    );

    service::notify_ready().context("Failed to notify systemd ready")?;

    let acquisition = if config.acquisition.enabled {
        let settings = config.acquisition.settings()?;
        let (bridge, link) = create_acquisition_bridge();
        let worker = AcquisitionWorker::new(context.clone(), link, readout, settings);
        let handle = spawn_acquisition(worker).context("Failed to spawn acquisition thread")?;
        Some((bridge, handle))
    } else {
        info!("Acquisition disabled; running monitor polls only");
        None
    };

    info!("Press Ctrl+C to stop");
    let outcome = match &acquisition {
        Some((bridge, _)) => supervise(&config, &context, bridge).await,
        None => monitor_until_interrupted(&config, &context).await,
    };

    if let Some((_, handle)) = acquisition {
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("Acquisition join task failed")?
            .map_err(|e| anyhow!("Acquisition thread panicked: {:?}", e))?;
    }

    tokio::task::spawn_blocking({
        let context = context.clone();
        let mut modules = modules;
        move || control::end_run(context.arbiter(), &mut modules)
    })
    .await
    .context("End-of-run task failed")?;

    info!("Shutdown complete");
    outcome
}

fn monitor_interval(config: &ControllerConfig) -> Option<Duration> {
    match config.control.poll_interval_secs {
        _ if config.control.monitor.is_empty() => None,
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

async fn poll_once(points: Vec<MonitorPoint>, context: RunContext<UsbTransport>) {
    let results =
        tokio::task::spawn_blocking(move || control::poll_monitor(context.arbiter(), &points)).await;
    match results {
        Ok(results) => {
            for (point, reply) in results {
                match reply {
                    Ok(reply) => info!(
                        "Monitor B{} C{} N{} A{} F{}: {:#08x} {}",
                        point.branch, point.crate_number, point.n, point.a, point.f, reply.data,
                        reply.qx
                    ),
                    Err(e) => warn!("Monitor poll failed: {}", e),
                }
            }
        }
        Err(e) => error!("Monitor task failed: {}", e),
    }
}

/// Forward acquisition events, poll monitors, and stop on Ctrl-C
async fn supervise(
    config: &ControllerConfig,
    context: &RunContext<UsbTransport>,
    bridge: &AcquisitionBridge,
) -> Result<()> {
    let interval = monitor_interval(config).unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    // Runs beside the event loop so buffers keep draining while it waits for the token
    let mut poll: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            result = &mut ctrl_c, if !stopping => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, stopping acquisition...");
                bridge
                    .send_command(AcquisitionCommand::Stop)
                    .await
                    .context("Failed to send stop command")?;
                stopping = true;
            }
            _ = ticker.tick(), if !stopping && poll.is_none() && monitor_interval(config).is_some() => {
                poll = Some(tokio::spawn(poll_once(
                    config.control.monitor.clone(),
                    context.clone(),
                )));
            }
            result = async {
                match poll.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            }, if poll.is_some() => {
                poll = None;
                if let Err(e) = result {
                    error!("Monitor task failed: {}", e);
                }
            }
            event = bridge.recv_event() => {
                match event.context("Acquisition thread went away")? {
                    AcquisitionEvent::Started => {
                        info!("Acquisition started");
                        if let Err(e) = service::notify_status("acquiring") {
                            debug!("{:#}", e);
                        }
                    }
                    AcquisitionEvent::Buffer { header, data } => {
                        debug!("Buffer: {} bytes, {} events", data.len(), header.events);
                    }
                    AcquisitionEvent::Suspended => debug!("Acquisition suspended"),
                    AcquisitionEvent::Resumed => debug!("Acquisition resumed"),
                    AcquisitionEvent::Stopped { buffers, events } => {
                        info!("Run ended: {} buffers, {} events", buffers, events);
                        return Ok(());
                    }
                    AcquisitionEvent::Failed { reason } => {
                        return Err(anyhow!("Acquisition failed: {}", reason));
                    }
                }
            }
        }
    }
}

async fn monitor_until_interrupted(
    config: &ControllerConfig,
    context: &RunContext<UsbTransport>,
) -> Result<()> {
    let Some(interval) = monitor_interval(config) else {
        signal::ctrl_c().await.context("Error waiting for Ctrl+C")?;
        return Ok(());
    };
    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Error waiting for Ctrl+C")?;
                return Ok(());
            }
            _ = ticker.tick() => {
                poll_once(config.control.monitor.clone(), context.clone()).await;
            }
        }
    }
}
