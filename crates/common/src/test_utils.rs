//! Test utilities for vmusb-rs
//!
//! Provides a scripted [`MockTransport`] and a [`BridgeSimulator`] that answers
//! CAMAC branch-driver traffic, for testing across crates without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::BridgeSimulator;
//! use common::TransportExt;
//!
//! let sim = BridgeSimulator::new();
//! sim.state().lock().unwrap().controller_registers.insert(0, 0x0a05);
//! let mut transport = sim.transport();
//! assert_eq!(transport.read_register(0).unwrap(), 0x0a05);
//! ```

use crate::transport::{DEFAULT_TIMEOUT, Transport};
use protocol::camac::{self, BRIDGE_CRATE, BRIDGE_STATION, BTB_SUBADDRESS, CSR_SUBADDRESS};
use protocol::{
    CamacAddress, CamacWidth, DataWidth, Operation, QxStatus, TransactionResult, UsbError,
    decode_packet,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One call made on a [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Write(Vec<u8>),
    Transaction(Vec<u8>),
    Read,
}

type Responder = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, UsbError> + Send>;

/// Transport that records every call and answers through a responder closure
///
/// Writes and transactions pass their packet to the responder; an `Err`
/// becomes `WriteFailed` for writes and `ReadFailed` for transactions.
/// Streaming reads pop queued buffers and time out when none are left.
pub struct MockTransport {
    responder: Responder,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    stream: Arc<Mutex<VecDeque<Vec<u8>>>>,
    timeout: Duration,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, UsbError> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
            stream: Arc::new(Mutex::new(VecDeque::new())),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Shared handle on the call log
    pub fn calls(&self) -> Arc<Mutex<Vec<TransportCall>>> {
        Arc::clone(&self.calls)
    }

    /// Shared handle on the queue of buffers returned by `read`
    pub fn stream(&self) -> Arc<Mutex<VecDeque<Vec<u8>>>> {
        Arc::clone(&self.stream)
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for MockTransport {
    fn transaction(&mut self, request: &[u8], response: &mut [u8]) -> TransactionResult {
        self.record(TransportCall::Transaction(request.to_vec()));
        match (self.responder)(request) {
            Ok(reply) => {
                let n = reply.len().min(response.len());
                response[..n].copy_from_slice(&reply[..n]);
                TransactionResult::ok(n)
            }
            Err(e) => TransactionResult::read_failed(e),
        }
    }

    fn write(&mut self, packet: &[u8]) -> TransactionResult {
        self.record(TransportCall::Write(packet.to_vec()));
        match (self.responder)(packet) {
            Ok(_) => TransactionResult::ok(packet.len()),
            Err(e) => TransactionResult::write_failed(e),
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> TransactionResult {
        self.record(TransportCall::Read);
        let next = self.stream.lock().unwrap().pop_front();
        match next {
            Some(data) => {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                TransactionResult::ok(n)
            }
            None => {
                std::thread::sleep(Duration::from_millis(1));
                TransactionResult::read_failed(UsbError::Timeout)
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

/// A CAMAC cycle observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CamacCycle {
    pub address: CamacAddress,
    pub width: CamacWidth,
    /// Datum for writes, `None` for reads and control cycles
    pub datum: Option<u16>,
}

/// State of a simulated branch driver and its crates
#[derive(Debug, Default)]
pub struct BridgeState {
    /// Q and X reported by the CSR
    pub qx: QxStatus,
    /// Crates that answer the branch test
    pub online: u8,
    /// Branch-test polls each crate stays off line before coming on line
    pub offline_polls: HashMap<u8, u32>,
    /// Number of branch-test reads seen
    pub branch_tests: usize,
    /// 24-bit module registers keyed by (branch, crate, station, subaddress)
    pub registers: HashMap<(u8, u8, u8, u8), u32>,
    /// Controller internal registers
    pub controller_registers: HashMap<u32, u32>,
    /// Every CAMAC cycle, in execution order
    pub cycles: Vec<CamacCycle>,
    /// Every delay seen, in clocks
    pub delays: Vec<u8>,
    pending_high: Option<u32>,
}

impl BridgeState {
    fn key(address: &CamacAddress) -> (u8, u8, u8, u8) {
        (
            address.branch(),
            address.crate_number(),
            address.station(),
            address.subaddress(),
        )
    }

    fn is_bridge_register(address: &CamacAddress, subaddress: u8) -> bool {
        address.crate_number() == BRIDGE_CRATE
            && address.station() == BRIDGE_STATION
            && address.subaddress() == subaddress
    }

    fn camac_write(&mut self, word: u32, datum: u16) {
        let decoded = camac::decode(word);
        self.cycles.push(CamacCycle {
            address: decoded.address,
            width: decoded.width,
            datum: Some(datum),
        });
        let key = Self::key(&decoded.address);
        match decoded.width {
            CamacWidth::Bits24 => self.pending_high = Some(u32::from(datum) & 0xff),
            CamacWidth::Bits16 => {
                let high = self.pending_high.take().unwrap_or(0);
                self.registers.insert(key, (high << 16) | u32::from(datum));
            }
        }
    }

    fn camac_read(&mut self, word: u32) -> u16 {
        let decoded = camac::decode(word);
        self.cycles.push(CamacCycle {
            address: decoded.address,
            width: decoded.width,
            datum: None,
        });

        if Self::is_bridge_register(&decoded.address, CSR_SUBADDRESS) {
            let mut csr = 0;
            if self.qx.q {
                csr |= camac::CSR_Q;
            }
            if self.qx.x {
                csr |= camac::CSR_X;
            }
            return csr as u16;
        }
        if Self::is_bridge_register(&decoded.address, BTB_SUBADDRESS) {
            self.branch_tests += 1;
            let mut online = self.online;
            for (crate_, polls) in self.offline_polls.iter_mut() {
                if *polls > 0 {
                    *polls -= 1;
                    online &= !(1 << crate_);
                } else {
                    online |= 1 << crate_;
                }
            }
            return u16::from(online);
        }

        let value = self
            .registers
            .get(&Self::key(&decoded.address))
            .copied()
            .unwrap_or(0);
        match decoded.width {
            CamacWidth::Bits24 => ((value >> 16) & 0xff) as u16,
            CamacWidth::Bits16 => (value & 0xffff) as u16,
        }
    }

    fn respond(&mut self, packet: &[u8]) -> Result<Vec<u8>, UsbError> {
        let (_, list) = decode_packet(packet).map_err(|e| UsbError::Other {
            message: e.to_string(),
        })?;

        let mut reply = Vec::new();
        for operation in &list {
            match operation {
                Operation::Write {
                    width: DataWidth::D16,
                    address,
                    datum,
                    ..
                } => self.camac_write(*address, *datum as u16),
                Operation::Read {
                    width: DataWidth::D16,
                    address,
                    ..
                } => reply.extend_from_slice(&self.camac_read(*address).to_le_bytes()),
                Operation::Read { width, .. } => {
                    reply.extend(std::iter::repeat_n(0u8, width.bytes().max(2)))
                }
                Operation::RegisterRead { register } => {
                    let value = self
                        .controller_registers
                        .get(register)
                        .copied()
                        .unwrap_or(0);
                    reply.extend_from_slice(&value.to_le_bytes());
                }
                Operation::RegisterWrite { register, datum } => {
                    self.controller_registers.insert(*register, *datum);
                }
                Operation::BlockRead { count, .. } | Operation::FifoRead { count, .. } => {
                    reply.extend(std::iter::repeat_n(0u8, count.get() as usize * 4))
                }
                Operation::Marker { value } => reply.extend_from_slice(&value.to_le_bytes()),
                Operation::Delay { clocks } => self.delays.push(*clocks),
                Operation::Write { .. } => {}
            }
        }
        Ok(reply)
    }
}

/// Answers CAMAC branch-driver traffic through a [`MockTransport`]
///
/// Non-list packets (action register writes) are accepted and ignored.
#[derive(Clone, Default)]
pub struct BridgeSimulator {
    state: Arc<Mutex<BridgeState>>,
}

impl BridgeSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<BridgeState>> {
        Arc::clone(&self.state)
    }

    /// A transport wired to this simulator
    pub fn transport(&self) -> MockTransport {
        let state = Arc::clone(&self.state);
        MockTransport::new(move |packet| {
            if packet.len() == 6 && packet[..4] == [0x05, 0x00, 0x0a, 0x00] {
                return Ok(Vec::new());
            }
            state.lock().unwrap().respond(packet)
        })
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
