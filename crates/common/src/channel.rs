//! Async channel bridge between the Tokio runtime and the acquisition thread

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::BufferHeader;

/// Commands from the Tokio runtime to the acquisition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionCommand {
    /// End the run and release the controller
    Stop,
}

/// Events from the acquisition thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionEvent {
    /// Readout stack loaded and data taking enabled
    Started,

    /// One buffer read from the controller
    Buffer {
        /// Decoded first word of the buffer
        header: BufferHeader,
        /// Raw buffer contents, header included
        data: Vec<u8>,
    },

    /// Triggering stopped so the control path can use the controller
    Suspended,

    /// Triggering re-enabled after a control operation
    Resumed,

    /// Run ended
    Stopped {
        /// Buffers read during the run
        buffers: u64,
        /// Events counted from buffer headers
        events: u64,
    },

    /// Run aborted by an error
    Failed {
        /// Error description
        reason: String,
    },
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct AcquisitionBridge {
    cmd_tx: Sender<AcquisitionCommand>,
    event_rx: Receiver<AcquisitionEvent>,
}

impl AcquisitionBridge {
    /// Send a command to the acquisition thread
    pub async fn send_command(&self, cmd: AcquisitionCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the acquisition thread
    pub async fn recv_event(&self) -> crate::Result<AcquisitionEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the acquisition thread (blocking)
pub struct AcquisitionLink {
    pub(crate) cmd_rx: Receiver<AcquisitionCommand>,
    /// Event sender (public for the acquisition thread to access)
    pub event_tx: Sender<AcquisitionEvent>,
}

impl AcquisitionLink {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<AcquisitionCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the runtime side has gone away
    pub fn is_closed(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Send an event without blocking; a full channel hands the event back
    pub fn try_send_event(
        &self,
        event: AcquisitionEvent,
    ) -> std::result::Result<(), TrySendError<AcquisitionEvent>> {
        self.event_tx.try_send(event)
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: AcquisitionEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the acquisition thread
///
/// Returns (AcquisitionBridge for Tokio, AcquisitionLink for the acquisition thread)
pub fn create_acquisition_bridge() -> (AcquisitionBridge, AcquisitionLink) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let (event_tx, event_rx) = bounded(256);

    (
        AcquisitionBridge { cmd_tx, event_rx },
        AcquisitionLink { cmd_rx, event_tx },
    )
}
