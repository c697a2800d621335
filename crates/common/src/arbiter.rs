//! Serialized access to the controller between acquisition and control
//!
//! The controller has one transport and two users: the acquisition thread,
//! which streams triggered buffers for as long as a run is active, and the
//! control path, which issues sporadic one-shot operations. [`ResourceArbiter`]
//! owns the transport and hands it to exactly one of them at a time.
//!
//! Control access goes through [`ResourceArbiter::acquire_for_control`]. If
//! acquisition holds the token, it is asked to suspend and the caller blocks
//! until the acquisition thread parks. Dropping the returned [`ControlGuard`]
//! (or calling [`ControlGuard::release_from_control`]) lets acquisition resume.
//!
//! The acquisition thread never acquires the token per operation. It opens an
//! [`AcquisitionSession`] once per run and checks
//! [`AcquisitionSession::suspend_requested`] between reads.

use crate::error::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Current holder of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationToken {
    Idle,
    HeldByAcquisition,
    HeldByControl,
}

#[derive(Debug)]
struct ArbiterState {
    token: ArbitrationToken,
    acquisition_active: bool,
    suspend_requested: bool,
    waiting_controls: usize,
}

/// Owner of the transport, shared between the acquisition and control paths
#[derive(Debug)]
pub struct ResourceArbiter<T> {
    state: Mutex<ArbiterState>,
    changed: Condvar,
    transport: Mutex<T>,
}

impl<T> ResourceArbiter<T> {
    pub fn new(transport: T) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                token: ArbitrationToken::Idle,
                acquisition_active: false,
                suspend_requested: false,
                waiting_controls: 0,
            }),
            changed: Condvar::new(),
            transport: Mutex::new(transport),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ArbiterState>) -> MutexGuard<'a, ArbiterState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transport(&self) -> MutexGuard<'_, T> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> ArbitrationToken {
        self.lock_state().token
    }

    pub fn is_acquisition_active(&self) -> bool {
        self.lock_state().acquisition_active
    }

    /// Whether a control caller has asked the running acquisition to suspend
    pub fn suspend_requested(&self) -> bool {
        self.lock_state().suspend_requested
    }

    /// Take the transport for the control path
    ///
    /// Blocks until the token is free. A running acquisition is asked to
    /// suspend and the call returns once it has parked.
    pub fn acquire_for_control(&self) -> ControlGuard<'_, T> {
        let mut state = self.lock_state();
        state.waiting_controls += 1;
        loop {
            match state.token {
                ArbitrationToken::Idle => break,
                ArbitrationToken::HeldByControl => state = self.wait(state),
                ArbitrationToken::HeldByAcquisition => {
                    if !state.suspend_requested {
                        debug!("Requesting acquisition suspend for control access");
                        state.suspend_requested = true;
                        self.changed.notify_all();
                    }
                    state = self.wait(state);
                }
            }
        }
        state.token = ArbitrationToken::HeldByControl;
        state.waiting_controls -= 1;
        drop(state);

        trace!("Control path holds the transport");
        ControlGuard {
            arbiter: self,
            transport: Some(self.lock_transport()),
        }
    }

    /// Run `f` with exclusive control access
    pub fn with_control<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire_for_control();
        f(&mut guard)
    }

    /// Claim the transport for a run
    ///
    /// Waits for pending control operations to finish first. Only one
    /// session may exist at a time.
    pub fn begin_acquisition(&self) -> Result<AcquisitionSession<'_, T>> {
        let mut state = self.lock_state();
        if state.acquisition_active {
            return Err(Error::Arbiter("acquisition is already active".to_string()));
        }
        while state.token != ArbitrationToken::Idle || state.waiting_controls > 0 {
            state = self.wait(state);
        }
        state.acquisition_active = true;
        state.suspend_requested = false;
        state.token = ArbitrationToken::HeldByAcquisition;
        drop(state);

        debug!("Acquisition holds the transport");
        Ok(AcquisitionSession {
            arbiter: self,
            transport: Some(self.lock_transport()),
        })
    }

    fn release_control(&self) {
        let mut state = self.lock_state();
        state.token = ArbitrationToken::Idle;
        if state.waiting_controls == 0 {
            state.suspend_requested = false;
        }
        drop(state);
        self.changed.notify_all();
        trace!("Control path released the transport");
    }
}

/// Exclusive control-path access to the transport
///
/// Releases the token on drop.
pub struct ControlGuard<'a, T> {
    arbiter: &'a ResourceArbiter<T>,
    transport: Option<MutexGuard<'a, T>>,
}

impl<T> ControlGuard<'_, T> {
    /// Give the transport back and let acquisition resume
    pub fn release_from_control(self) {
        drop(self);
    }
}

impl<T> Deref for ControlGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.transport
            .as_deref()
            .unwrap_or_else(|| unreachable!("control guard used after release"))
    }
}

impl<T> DerefMut for ControlGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("control guard used after release"))
    }
}

impl<T> Drop for ControlGuard<'_, T> {
    fn drop(&mut self) {
        self.transport.take();
        self.arbiter.release_control();
    }
}

/// The acquisition thread's hold on the transport for one run
///
/// Dropping the session ends the run and frees the token.
pub struct AcquisitionSession<'a, T> {
    arbiter: &'a ResourceArbiter<T>,
    transport: Option<MutexGuard<'a, T>>,
}

impl<'a, T> AcquisitionSession<'a, T> {
    /// Whether a control caller is waiting for the transport
    pub fn suspend_requested(&self) -> bool {
        self.arbiter.suspend_requested()
    }

    /// Hand the transport to waiting control callers and block until they are done
    ///
    /// The caller must already have stopped triggering. On return the session
    /// holds the transport again.
    pub fn park(&mut self) {
        self.transport.take();

        let arbiter = self.arbiter;
        let mut state = arbiter.lock_state();
        state.token = ArbitrationToken::Idle;
        arbiter.changed.notify_all();
        debug!("Acquisition parked");

        while state.token != ArbitrationToken::Idle || state.waiting_controls > 0 {
            state = arbiter.wait(state);
        }
        state.token = ArbitrationToken::HeldByAcquisition;
        state.suspend_requested = false;
        drop(state);

        self.transport = Some(arbiter.lock_transport());
        debug!("Acquisition resumed");
    }

    pub fn transport(&mut self) -> &mut T {
        self.transport
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("transport is only released inside park"))
    }
}

impl<T> Drop for AcquisitionSession<'_, T> {
    fn drop(&mut self) {
        self.transport.take();
        let mut state = self.arbiter.lock_state();
        state.token = ArbitrationToken::Idle;
        state.acquisition_active = false;
        state.suspend_requested = false;
        drop(state);
        self.arbiter.changed.notify_all();
        debug!("Acquisition session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_control_acquire_and_release() {
        let arbiter = ResourceArbiter::new(0u32);
        assert_eq!(arbiter.token(), ArbitrationToken::Idle);

        let mut guard = arbiter.acquire_for_control();
        *guard += 1;
        assert_eq!(arbiter.token(), ArbitrationToken::HeldByControl);
        guard.release_from_control();

        assert_eq!(arbiter.token(), ArbitrationToken::Idle);
        assert_eq!(arbiter.with_control(|value| *value), 1);
    }

    #[test]
    fn test_concurrent_controls_are_serialized() {
        let arbiter = Arc::new(ResourceArbiter::new(()));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arbiter = Arc::clone(&arbiter);
                let inside = Arc::clone(&inside);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    for _ in 0..10 {
                        arbiter.with_control(|_| {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlap.store(true, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_session_rejected() {
        let arbiter = ResourceArbiter::new(());
        let _session = arbiter.begin_acquisition().unwrap();
        assert!(arbiter.is_acquisition_active());
        assert!(matches!(arbiter.begin_acquisition(), Err(Error::Arbiter(_))));
    }

    #[test]
    fn test_control_suspends_acquisition_without_interleaving() {
        let arbiter = Arc::new(ResourceArbiter::new(()));
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let parks = Arc::new(AtomicUsize::new(0));

        let acquisition = {
            let arbiter = Arc::clone(&arbiter);
            let log = Arc::clone(&log);
            let stop = Arc::clone(&stop);
            let parks = Arc::clone(&parks);
            thread::spawn(move || {
                let mut session = arbiter.begin_acquisition().unwrap();
                while !stop.load(Ordering::SeqCst) {
                    let _ = session.transport();
                    log.lock().unwrap().push("acquisition");
                    if session.suspend_requested() {
                        parks.fetch_add(1, Ordering::SeqCst);
                        session.park();
                    }
                    thread::sleep(Duration::from_micros(100));
                }
            })
        };

        while !arbiter.is_acquisition_active() {
            thread::sleep(Duration::from_millis(1));
        }

        for _ in 0..5 {
            let guard = arbiter.acquire_for_control();
            log.lock().unwrap().push("control-start");
            thread::sleep(Duration::from_millis(5));
            log.lock().unwrap().push("control-end");
            drop(guard);
            thread::sleep(Duration::from_millis(2));
        }

        stop.store(true, Ordering::SeqCst);
        acquisition.join().unwrap();

        assert!(parks.load(Ordering::SeqCst) >= 1);
        assert_eq!(arbiter.token(), ArbitrationToken::Idle);
        assert!(!arbiter.is_acquisition_active());

        let log = log.lock().unwrap();
        let mut in_control = false;
        for entry in log.iter() {
            match *entry {
                "control-start" => in_control = true,
                "control-end" => in_control = false,
                _ => assert!(!in_control, "acquisition ran during a control hold"),
            }
        }
    }
}
