//! Acquisition bridge and arbiter integration tests
//!
//! Exercises the channel bridge, the arbiter and the mock transports together
//! the way the controller binary wires them.
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::test_utils::{BridgeSimulator, DEFAULT_TEST_TIMEOUT, TransportCall, with_timeout};
use common::{
    AcquisitionCommand, AcquisitionEvent, ArbitrationToken, ResourceArbiter, RunContext, RunState,
    TransportExt, action, create_acquisition_bridge,
};
use protocol::BufferHeader;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Bridge Message Flow
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, link) = create_acquisition_bridge();

    let handle = thread::spawn(move || {
        link.send_event(AcquisitionEvent::Started).unwrap();
        for events in 1..=3u16 {
            link.send_event(AcquisitionEvent::Buffer {
                header: BufferHeader::from_word(events),
                data: events.to_le_bytes().to_vec(),
            })
            .unwrap();
        }
        link.send_event(AcquisitionEvent::Stopped {
            buffers: 3,
            events: 6,
        })
        .unwrap();
    });

    assert_eq!(
        with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .unwrap()
            .unwrap(),
        AcquisitionEvent::Started
    );

    let mut counted = 0u64;
    loop {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .unwrap()
            .unwrap();
        match event {
            AcquisitionEvent::Buffer { header, .. } => counted += u64::from(header.events),
            AcquisitionEvent::Stopped { events, .. } => {
                assert_eq!(events, counted);
                break;
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    handle.join().unwrap();
}

#[tokio::test]
async fn test_stop_command_reaches_worker() {
    let (bridge, link) = create_acquisition_bridge();

    let handle = thread::spawn(move || {
        loop {
            match link.try_recv_command() {
                Some(AcquisitionCommand::Stop) => return true,
                None if link.is_closed() => return false,
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    });

    bridge.send_command(AcquisitionCommand::Stop).await.unwrap();
    assert!(handle.join().unwrap());
}

// ============================================================================
// Arbiter With A Simulated Controller
// ============================================================================

#[test]
fn test_control_reads_register_during_acquisition() {
    let sim = BridgeSimulator::new();
    sim.state()
        .lock()
        .unwrap()
        .controller_registers
        .insert(0x08, 0x1234);
    let transport = sim.transport();
    let calls = transport.calls();
    let context = RunContext::new(transport);

    let worker = {
        let context = context.clone();
        thread::spawn(move || {
            let arbiter = context.arbiter();
            let mut session = arbiter.begin_acquisition().unwrap();
            session
                .transport()
                .write_action_register(action::START_DAQ)
                .unwrap();
            context.set_run_state(RunState::Active);
            loop {
                if session.suspend_requested() {
                    session.transport().write_action_register(0).unwrap();
                    session.park();
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            session.transport().write_action_register(0).unwrap();
            context.set_run_state(RunState::Inactive);
        })
    };

    while context.run_state() != RunState::Active {
        thread::sleep(Duration::from_millis(1));
    }

    let value = context
        .arbiter()
        .with_control(|transport| transport.read_register(0x08))
        .unwrap();
    assert_eq!(value, 0x1234);

    worker.join().unwrap();
    assert_eq!(context.arbiter().token(), ArbitrationToken::Idle);

    // start, stop for suspend, register read, final stop
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 4);
    assert_eq!(
        calls[0],
        TransportCall::Write(vec![0x05, 0x00, 0x0a, 0x00, 0x01, 0x00])
    );
    assert!(matches!(calls[2], TransportCall::Transaction(_)));
}

#[test]
fn test_acquisition_waits_for_control_holder() {
    let arbiter = Arc::new(ResourceArbiter::new(Vec::<&'static str>::new()));
    let mut guard = arbiter.acquire_for_control();

    let worker = {
        let arbiter = Arc::clone(&arbiter);
        thread::spawn(move || {
            let mut session = arbiter.begin_acquisition().unwrap();
            session.transport().push("acquisition");
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!arbiter.is_acquisition_active());
    guard.push("control");
    guard.release_from_control();

    worker.join().unwrap();
    assert_eq!(
        arbiter.with_control(|log| log.clone()),
        vec!["control", "acquisition"]
    );
}
