//! Systemd notification for headless runs
//!
//! Speaks the sd_notify datagram protocol when `NOTIFY_SOCKET` is set and is
//! a no-op otherwise.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

pub fn is_systemd() -> bool {
    env::var_os("NOTIFY_SOCKET").is_some()
}

fn notify(message: &str) -> Result<()> {
    let Some(socket_path) = env::var_os("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping '{}'", message);
        return Ok(());
    };
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    debug!("Notified systemd: {}", message);
    Ok(())
}

/// Bring-up finished and the run is under way
pub fn notify_ready() -> Result<()> {
    notify("READY=1")
}

pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1")
}

/// Free-form status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={}", status))
}
