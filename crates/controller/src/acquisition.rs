//! Acquisition worker
//!
//! Runs on a dedicated thread for the whole run. It loads the readout stack,
//! enables data taking, and forwards every buffer the controller streams to
//! the Tokio runtime. When the control path asks for the controller, the
//! worker stops data taking, drains what is in flight, parks until the
//! control operation is done, and re-enables data taking.

use byteorder::{ByteOrder, LittleEndian};
use async_channel::TrySendError;
use common::{
    AcquisitionCommand, AcquisitionEvent, AcquisitionLink, AcquisitionSession, Error, Result,
    RunContext, RunState, Transport, TransportExt, action,
};
use protocol::{BufferHeader, OperationList, StackSlot, TransactionStatus, UsbError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Thread name of the acquisition worker
pub const THREAD_NAME: &str = "vmusb-acq";

/// Upper bound on buffers read while draining after a stop
const MAX_DRAIN_BUFFERS: usize = 64;

/// Pause between send attempts while the event channel is full
const EVENT_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Stack slot the readout list is loaded into
    pub slot: StackSlot,
    /// Load offset within stack memory
    pub offset: u16,
    /// Size of one streaming read
    pub buffer_size: usize,
    /// Timeout of one streaming read; also bounds suspend latency
    pub read_timeout: Duration,
}

/// Counters reported when the run ends
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStatistics {
    pub buffers: u64,
    pub events: u64,
    /// Buffers not forwarded because the consumer fell behind during a suspend
    pub dropped: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// The acquisition thread's state for one run
pub struct AcquisitionWorker<T> {
    context: RunContext<T>,
    link: AcquisitionLink,
    readout: OperationList,
    settings: AcquisitionSettings,
    stats: RunStatistics,
    buffer: Vec<u8>,
}

impl<T: Transport> AcquisitionWorker<T> {
    pub fn new(
        context: RunContext<T>,
        link: AcquisitionLink,
        readout: OperationList,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            context,
            link,
            readout,
            buffer: vec![0u8; settings.buffer_size],
            settings,
            stats: RunStatistics::default(),
        }
    }

    /// Run until stopped or failed, reporting the outcome over the link
    pub fn run(mut self) {
        info!("Acquisition worker started");
        self.context.set_run_state(RunState::Starting);

        let arbiter = Arc::clone(self.context.arbiter());
        let outcome = match arbiter.begin_acquisition() {
            Ok(mut session) => self.run_session(&mut session),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(
                    "Acquisition stopped: {} buffers, {} events",
                    self.stats.buffers, self.stats.events
                );
                if self.stats.dropped > 0 {
                    warn!("{} buffers were dropped by a full event channel", self.stats.dropped);
                }
                self.emit(AcquisitionEvent::Stopped {
                    buffers: self.stats.buffers,
                    events: self.stats.events,
                });
            }
            Err(e) => {
                error!("Acquisition failed: {}", e);
                self.emit(AcquisitionEvent::Failed {
                    reason: e.to_string(),
                });
            }
        }
        self.context.set_run_state(RunState::Inactive);
    }

    fn run_session(&mut self, session: &mut AcquisitionSession<'_, T>) -> Result<()> {
        let control_timeout = session.transport().timeout();
        let result = self.take_data(session, control_timeout);

        // Leave the controller idle and usable by the control path whatever happened
        let transport = session.transport();
        if let Err(e) = transport.write_action_register(0) {
            warn!("Failed to disable data taking: {}", e);
        }
        transport.set_timeout(control_timeout);
        result
    }

    fn take_data(
        &mut self,
        session: &mut AcquisitionSession<'_, T>,
        control_timeout: Duration,
    ) -> Result<()> {
        let transport = session.transport();
        transport.load_list(&self.readout, self.settings.slot, self.settings.offset)?;
        info!(
            "Loaded {} readout operations into {}",
            self.readout.len(),
            self.settings.slot
        );
        self.start(transport)?;
        self.context.set_run_state(RunState::Active);
        if !self.emit(AcquisitionEvent::Started) {
            return Ok(());
        }

        loop {
            if self.stop_requested() {
                self.context.set_run_state(RunState::Stopping);
                self.stop(session.transport())?;
                return Ok(());
            }

            if session.suspend_requested() {
                self.suspend(session, control_timeout)?;
                continue;
            }

            if let Flow::Stop = self.read_one(session.transport())? {
                return Ok(());
            }
        }
    }

    fn stop_requested(&self) -> bool {
        match self.link.try_recv_command() {
            Some(AcquisitionCommand::Stop) => true,
            None => self.link.is_closed(),
        }
    }

    fn start(&mut self, transport: &mut T) -> Result<()> {
        transport.set_timeout(self.settings.read_timeout);
        transport.write_action_register(action::START_DAQ)
    }

    /// Disable data taking and read out whatever the controller still holds
    fn stop(&mut self, transport: &mut T) -> Result<()> {
        transport.write_action_register(0)?;
        for _ in 0..MAX_DRAIN_BUFFERS {
            match self.read_buffer(transport)? {
                Some(header) if header.last => break,
                Some(_) => {}
                None => break,
            }
        }
        Ok(())
    }

    /// Stop data taking and hand the transport to the control path with its
    /// own timeout, then restart
    fn suspend(
        &mut self,
        session: &mut AcquisitionSession<'_, T>,
        control_timeout: Duration,
    ) -> Result<()> {
        debug!("Suspending data taking for control access");
        let transport = session.transport();
        let read_timeout = transport.timeout();
        self.stop(transport)?;
        transport.set_timeout(control_timeout);
        self.emit(AcquisitionEvent::Suspended);

        session.park();

        let transport = session.transport();
        transport.set_timeout(read_timeout);
        transport.write_action_register(action::START_DAQ)?;
        self.emit(AcquisitionEvent::Resumed);
        debug!("Data taking resumed");
        Ok(())
    }

    fn read_one(&mut self, transport: &mut T) -> Result<Flow> {
        self.read_buffer(transport)?;
        if self.link.event_tx.is_closed() {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    /// Read and forward one buffer; `None` if nothing arrived before the timeout
    fn read_buffer(&mut self, transport: &mut T) -> Result<Option<BufferHeader>> {
        let bytes = match transport.read(&mut self.buffer).into_result() {
            Ok(bytes) => bytes,
            Err(TransactionStatus::ReadFailed(UsbError::Timeout)) => return Ok(None),
            Err(status) => return Err(Error::transport("acquisition read", None, status)),
        };
        if bytes < 2 {
            return Ok(None);
        }

        let header = BufferHeader::from_word(LittleEndian::read_u16(&self.buffer[..2]));
        self.stats.buffers += 1;
        self.stats.events += u64::from(header.events);
        debug!(
            "Buffer {}: {} bytes, {} events{}{}",
            self.stats.buffers,
            bytes,
            header.events,
            if header.scaler { ", scaler" } else { "" },
            if header.last { ", last" } else { "" }
        );

        let data = self.buffer[..bytes].to_vec();
        self.emit(AcquisitionEvent::Buffer { header, data });
        Ok(Some(header))
    }

    /// Forward an event, waiting while the channel is full
    ///
    /// The wait is abandoned, and the event dropped, once a control caller
    /// asks for the transport. Returns false if the runtime side is gone.
    fn emit(&mut self, event: AcquisitionEvent) -> bool {
        let mut event = event;
        loop {
            match self.link.try_send_event(event) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => {
                    debug!("Event channel closed");
                    return false;
                }
                Err(TrySendError::Full(returned)) => {
                    if self.context.arbiter().suspend_requested() {
                        if let AcquisitionEvent::Buffer { .. } = returned {
                            self.stats.dropped += 1;
                            warn!("Event channel full, dropping buffer {}", self.stats.buffers);
                        } else {
                            debug!("Event channel full, dropping {:?}", returned);
                        }
                        return true;
                    }
                    event = returned;
                    std::thread::sleep(EVENT_RETRY);
                }
            }
        }
    }
}

/// Start the acquisition worker on its own thread
pub fn spawn_acquisition<T: Transport + 'static>(
    worker: AcquisitionWorker<T>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || worker.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_acquisition_bridge;
    use common::test_utils::{MockTransport, TransportCall};

    fn settings() -> AcquisitionSettings {
        AcquisitionSettings {
            slot: StackSlot::new(2).unwrap(),
            offset: 0,
            buffer_size: 64,
            read_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_buffers_forwarded_and_counted() {
        let transport = MockTransport::new(|_| Ok(Vec::new()));
        let stream = transport.stream();
        stream.lock().unwrap().push_back(vec![0x03, 0x00, 0xaa, 0xbb]);
        stream.lock().unwrap().push_back(vec![0x02, 0x20, 0xcc, 0xdd]);
        let calls = transport.calls();

        let context = RunContext::new(transport);
        let (bridge, link) = create_acquisition_bridge();
        let mut readout = OperationList::new();
        readout.add_marker(0xaaaa);

        let handle = spawn_acquisition(AcquisitionWorker::new(
            context.clone(),
            link,
            readout,
            settings(),
        ))
        .unwrap();

        assert_eq!(bridge.event_rx_blocking(), AcquisitionEvent::Started);
        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let AcquisitionEvent::Buffer { header, .. } = bridge.event_rx_blocking() {
                seen.push(header);
            }
        }
        assert_eq!(seen[0].events, 3);
        assert!(seen[1].scaler);

        bridge.stop_blocking();
        let mut stopped = None;
        while stopped.is_none() {
            if let AcquisitionEvent::Stopped { buffers, events } = bridge.event_rx_blocking() {
                stopped = Some((buffers, events));
            }
        }
        handle.join().unwrap();

        assert_eq!(stopped, Some((2, 5)));
        assert_eq!(context.run_state(), RunState::Inactive);
        let calls = calls.lock().unwrap();
        assert!(matches!(calls[0], TransportCall::Write(_)));
        assert_eq!(
            calls[1],
            TransportCall::Write(vec![0x05, 0x00, 0x0a, 0x00, 0x01, 0x00])
        );
    }

    #[test]
    fn test_fatal_read_error_fails_run() {
        let transport = MockTransport::new(|_| Err(UsbError::NoDevice));
        let context = RunContext::new(transport);
        let (bridge, link) = create_acquisition_bridge();

        AcquisitionWorker::new(context.clone(), link, OperationList::new(), settings()).run();

        match bridge.event_rx_blocking() {
            AcquisitionEvent::Failed { reason } => assert!(reason.contains("load stack")),
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(context.run_state(), RunState::Inactive);
        assert!(!context.arbiter().is_acquisition_active());
    }

    trait BlockingBridge {
        fn event_rx_blocking(&self) -> AcquisitionEvent;
        fn stop_blocking(&self);
    }

    impl BlockingBridge for common::AcquisitionBridge {
        fn event_rx_blocking(&self) -> AcquisitionEvent {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
                .block_on(async {
                    common::test_utils::with_timeout(
                        common::test_utils::DEFAULT_TEST_TIMEOUT,
                        self.recv_event(),
                    )
                    .await
                    .unwrap()
                    .unwrap()
                })
        }

        fn stop_blocking(&self) {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(self.send_command(AcquisitionCommand::Stop))
                .unwrap();
        }
    }
}
