//! Bring-up, monitor polls and end of run through the arbiter, with and
//! without an acquisition run in progress

use common::test_utils::{BridgeSimulator, DEFAULT_TEST_TIMEOUT, TransportCall, with_timeout};
use common::{
    AcquisitionBridge, AcquisitionCommand, AcquisitionEvent, DEFAULT_TIMEOUT, ResourceArbiter,
    RunContext, Transport, create_acquisition_bridge,
};
use controller::config::{BranchConfig, MonitorPoint};
use controller::control;
use controller::drivers::{
    CamacCycle, CamacRead, CamacReadable, CamacReadoutModule, Readable, build_readout_list,
};
use controller::{AcquisitionSettings, AcquisitionWorker, spawn_acquisition};
use protocol::camac::CamacWidth;
use protocol::{QxStatus, StackSlot};
use std::time::Duration;

fn adc() -> CamacReadoutModule {
    CamacReadoutModule {
        name: "adc".to_string(),
        branch: 0,
        crate_number: 1,
        station: 5,
        init: vec![CamacCycle {
            a: 0,
            f: 16,
            datum: 0x7ff,
        }],
        readout: vec![CamacRead {
            subaddress: 0,
            function: 0,
            width: CamacWidth::Bits24,
        }],
        end_run: vec![CamacCycle {
            a: 0,
            f: 9,
            datum: 0,
        }],
    }
}

fn settings() -> AcquisitionSettings {
    AcquisitionSettings {
        slot: StackSlot::new(2).unwrap(),
        offset: 0,
        buffer_size: 64,
        read_timeout: Duration::from_millis(5),
    }
}

fn monitor_points() -> Vec<MonitorPoint> {
    vec![MonitorPoint {
        branch: 0,
        crate_number: 1,
        n: 5,
        a: 2,
        f: 0,
    }]
}

async fn next_event(bridge: &AcquisitionBridge) -> AcquisitionEvent {
    with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap()
}

/// Stop the run and collect every event up to `Stopped`
async fn stop_and_collect(bridge: &AcquisitionBridge) -> Vec<AcquisitionEvent> {
    bridge.send_command(AcquisitionCommand::Stop).await.unwrap();
    let mut events = Vec::new();
    loop {
        let event = next_event(bridge).await;
        let stopped = matches!(event, AcquisitionEvent::Stopped { .. });
        events.push(event);
        if stopped {
            return events;
        }
    }
}

fn branch() -> BranchConfig {
    BranchConfig {
        branch: 0,
        crates: vec![1],
        settle_secs: 0,
        retry_secs: 0,
    }
}

#[test]
fn test_bring_up_then_end_run() {
    let sim = BridgeSimulator::new();
    {
        let state = sim.state();
        let mut state = state.lock().unwrap();
        state.online = 0b10;
        state.qx = QxStatus { q: true, x: true };
    }
    let arbiter = ResourceArbiter::new(sim.transport());
    let mut modules: Vec<Box<dyn Readable>> = vec![Box::new(CamacReadable::new(adc()))];

    control::bring_up(&arbiter, &[branch()], &mut modules).unwrap();
    {
        let state = sim.state();
        let state = state.lock().unwrap();
        assert_eq!(state.registers.get(&(0, 1, 5, 0)), Some(&0x7ff));
        assert_eq!(state.branch_tests, 1);
    }

    let readout = build_readout_list(&modules).unwrap();
    assert_eq!(readout.len(), 3);

    control::end_run(&arbiter, &mut modules);
    let state = sim.state();
    let state = state.lock().unwrap();
    let last_module_cycle = state
        .cycles
        .iter()
        .rev()
        .find(|c| c.address.station() == 5)
        .unwrap();
    assert_eq!(last_module_cycle.address.function(), 9);
}

#[test]
fn test_bring_up_stops_on_failed_init() {
    let arbiter = ResourceArbiter::new(common::test_utils::MockTransport::new(|_| {
        Err(protocol::UsbError::Timeout)
    }));
    let mut modules: Vec<Box<dyn Readable>> = vec![Box::new(CamacReadable::new(adc()))];

    assert!(control::bring_up(&arbiter, &[branch()], &mut modules).is_err());
    assert!(!arbiter.is_acquisition_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_poll_during_run() {
    let sim = BridgeSimulator::new();
    {
        let state = sim.state();
        let mut state = state.lock().unwrap();
        state.registers.insert((0, 1, 5, 2), 0x0001_0203);
        state.qx = QxStatus { q: true, x: true };
    }
    let transport = sim.transport();
    let calls = transport.calls();
    let context = RunContext::new(transport);

    let modules: Vec<Box<dyn Readable>> = vec![Box::new(CamacReadable::new(adc()))];
    let readout = build_readout_list(&modules).unwrap();
    let (bridge, link) = create_acquisition_bridge();
    let handle =
        spawn_acquisition(AcquisitionWorker::new(context.clone(), link, readout, settings()))
            .unwrap();

    assert_eq!(next_event(&bridge).await, AcquisitionEvent::Started);
    assert!(context.is_running());

    let poll_context = context.clone();
    let (timeout, results) = tokio::task::spawn_blocking(move || {
        let arbiter = poll_context.arbiter();
        let timeout = arbiter.with_control(|transport| transport.timeout());
        (timeout, control::poll_monitor(arbiter, &monitor_points()))
    })
    .await
    .unwrap();
    assert_eq!(timeout, DEFAULT_TIMEOUT);
    assert_eq!(results[0].1.as_ref().unwrap().data, 0x0001_0203);

    let events = stop_and_collect(&bridge).await;
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();
    assert!(!context.is_running());

    let suspends = events
        .iter()
        .filter(|e| **e == AcquisitionEvent::Suspended)
        .count();
    let resumes = events
        .iter()
        .filter(|e| **e == AcquisitionEvent::Resumed)
        .count();
    assert!(suspends >= 1);
    assert_eq!(suspends, resumes);
    assert_eq!(events[0], AcquisitionEvent::Suspended);

    // Every monitor transaction happened while data taking was off
    let calls = calls.lock().unwrap();
    let mut acquiring = false;
    for call in calls.iter() {
        match call {
            TransportCall::Write(packet) if packet.len() == 6 && packet[..4] == [5, 0, 10, 0] => {
                acquiring = packet[4] & 1 != 0;
            }
            TransportCall::Transaction(_) => assert!(!acquiring),
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_granted_while_event_channel_full() {
    let sim = BridgeSimulator::new();
    sim.state()
        .lock()
        .unwrap()
        .registers
        .insert((0, 1, 5, 2), 0x0000_0042);
    let transport = sim.transport();
    {
        let stream = transport.stream();
        let mut stream = stream.lock().unwrap();
        for _ in 0..400 {
            stream.push_back(vec![0x01, 0x00, 0xaa, 0xbb]);
        }
    }
    let context = RunContext::new(transport);

    let (bridge, link) = create_acquisition_bridge();
    let handle = spawn_acquisition(AcquisitionWorker::new(
        context.clone(),
        link,
        protocol::OperationList::new(),
        settings(),
    ))
    .unwrap();
    assert_eq!(next_event(&bridge).await, AcquisitionEvent::Started);

    // Nobody drains events while the control path waits for the token
    tokio::time::sleep(Duration::from_millis(200)).await;
    let poll_context = context.clone();
    let results = with_timeout(
        Duration::from_secs(3),
        tokio::task::spawn_blocking(move || {
            control::poll_monitor(poll_context.arbiter(), &monitor_points())
        }),
    )
    .await
    .expect("control access must not wait on the event consumer")
    .unwrap();
    assert_eq!(results[0].1.as_ref().unwrap().data, 0x42);

    let events = stop_and_collect(&bridge).await;
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();

    let forwarded = events
        .iter()
        .filter(|e| matches!(e, AcquisitionEvent::Buffer { .. }))
        .count() as u64;
    match events.last() {
        Some(AcquisitionEvent::Stopped { buffers, events: counted }) => {
            assert!(*buffers > 256);
            assert_eq!(*counted, *buffers);
            // buffers read during the suspend were dropped, not queued
            assert!(forwarded < *buffers);
        }
        other => panic!("Expected Stopped, got {:?}", other),
    }
}
