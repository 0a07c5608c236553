//! Connection lifecycle tests for DeviceManager
//!
//! Drives the manager with a MockTransport and hand-fed native events:
//! - Timeout-class connect failure followed by a scheduled retry
//! - Disconnect before a queued connect runs
//! - History bound and reset at cycle boundaries
//! - Categories that never reach the reconnect policy
//! - Give-up and long-term reconnect
//! - Discovery, bonding and transaction failures
//! - Drops mid-cycle and after initialization

use gattmux_core::test_utils::MockTransport;
use gattmux_core::{
    AttributeId, BondState, ConnectFailCategory, DeviceEvent, DeviceId, DeviceState,
    GattmuxConfig, GattmuxConfigBuilder, GattmuxError, Intent, NativeEvent, OperationKind,
    OperationState, ReconnectPhase, Timing,
};
use gattmux_device::{
    ConnectOptions, DeviceManager, ReconnectDecision, ReconnectEvent, TransactionPhase,
};
use gattmux_scheduler::Operation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Helpers
// ============================================================================

const STEP: Duration = Duration::from_millis(20);

fn device() -> DeviceId {
    DeviceId::parse("C0:FF:EE:00:00:01").unwrap()
}

fn attr() -> AttributeId {
    AttributeId::characteristic(Uuid::from_u128(0x180D), Uuid::from_u128(0x2A37))
}

fn manager_with(config: GattmuxConfig) -> (DeviceManager<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let manager = DeviceManager::new(config, transport.clone()).unwrap();
    (manager, transport)
}

fn manager() -> (DeviceManager<MockTransport>, MockTransport) {
    manager_with(GattmuxConfig::default())
}

fn ticks(manager: &mut DeviceManager<MockTransport>, n: usize) {
    for _ in 0..n {
        manager.tick(STEP);
    }
}

/// Connect and walk the device to INITIALIZED
fn initialized(manager: &mut DeviceManager<MockTransport>, d: &DeviceId) {
    manager.connect(d);
    manager.tick(STEP);
    manager.on_native_event(NativeEvent::success(d, OperationKind::Connect));
    manager.tick(STEP);
    manager.on_native_event(NativeEvent::success(d, OperationKind::DiscoverServices));
    assert!(manager.is(d, DeviceState::Initialized));
}

fn ended(events: &[DeviceEvent], kind: OperationKind) -> Vec<OperationState> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::OperationEnded { kind: k, state, .. } if *k == kind => Some(*state),
            _ => None,
        })
        .collect()
}

fn connect_fails(events: &[DeviceEvent]) -> Vec<ConnectFailCategory> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::ConnectFail(f) => Some(f.category),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_timeout_failure_schedules_retry_after_one_second() {
    let (mut m, transport) = manager();
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    assert!(m.scheduler().is_current(OperationKind::Connect, &d.clone().into()));

    m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 8));

    let history = m.history(&d);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, ConnectFailCategory::NativeConnectionFailed);
    assert_eq!(history[0].timing, Timing::TimedOut);
    assert_eq!(history[0].failure_count, 1);
    assert_eq!(history[0].native_status, Some(8));

    let events = m.drain_events();
    assert_eq!(ended(&events, OperationKind::Connect), vec![OperationState::TimedOut]);
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::ReconnectScheduled { phase: ReconnectPhase::ShortTerm, delay, .. }
            if *delay == Duration::from_secs(1)
    )));
    assert!(m.is(&d, DeviceState::ConnectingOverall));
    assert!(m.is(&d, DeviceState::ReconnectingShortTerm));
    assert!(m.is(&d, DeviceState::Disconnected));

    // nothing happens before the second is up
    ticks(&mut m, 49);
    assert!(!m.scheduler().is_pending(OperationKind::Connect, &d.clone().into()));

    m.tick(STEP);
    assert!(m.scheduler().is_queued(OperationKind::Connect, &d.clone().into()));

    m.tick(STEP);
    assert_eq!(transport.count(OperationKind::Connect), 2);
}

#[test]
fn test_disconnect_before_connect_runs_cancels_it() {
    let (mut m, transport) = manager();
    let d = device();

    m.connect(&d);
    m.disconnect(&d).unwrap();
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Disconnect));

    let events = m.drain_events();
    assert_eq!(ended(&events, OperationKind::Connect), vec![OperationState::Cancelled]);
    assert_eq!(
        ended(&events, OperationKind::Disconnect),
        vec![OperationState::Succeeded]
    );
    assert_eq!(transport.count(OperationKind::Connect), 0);
    assert!(m.history(&d).is_empty());
    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(!m.is(&d, DeviceState::ConnectingOverall));
    assert_eq!(m.device(&d).unwrap().intent(), Intent::Intentional);
}

#[test]
fn test_connect_during_disconnect_of_initialized_device_reinitializes() {
    let (mut m, transport) = manager();
    let d = device();
    initialized(&mut m, &d);
    m.drain_events();

    m.disconnect(&d).unwrap();
    assert!(m.is(&d, DeviceState::Connected));
    assert!(!m.is(&d, DeviceState::Initialized));
    m.tick(STEP);
    assert!(m.scheduler().is_current(OperationKind::Disconnect, &d.clone().into()));

    // the connect displaces the running disconnect and finds the link still up
    assert!(m.connect(&d).is_some());
    ticks(&mut m, 5);
    assert_eq!(transport.count(OperationKind::Connect), 1);
    assert!(m.is(&d, DeviceState::DiscoveringServices));

    m.on_native_event(NativeEvent::success(&d, OperationKind::DiscoverServices));
    ticks(&mut m, 5);

    let events = m.drain_events();
    assert_eq!(
        ended(&events, OperationKind::Disconnect),
        vec![OperationState::Cancelled]
    );
    assert_eq!(ended(&events, OperationKind::Connect), vec![OperationState::Redundant]);
    assert!(m.is(&d, DeviceState::Initialized));
    assert!(!m.is_any(&d, &[DeviceState::ConnectingOverall, DeviceState::Connecting]));
    assert!(m.device(&d).and_then(|dev| dev.cycle()).is_none());
    assert!(m.is_idle());

    // the device is usable again: disconnect, then connect from scratch
    m.disconnect(&d).unwrap();
    ticks(&mut m, 2);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Disconnect));
    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(m.connect(&d).is_some());
    ticks(&mut m, 2);
    assert_eq!(transport.count(OperationKind::Connect), 2);
}

// ============================================================================
// History
// ============================================================================

#[test]
fn test_history_is_bounded_oldest_first() {
    let config = GattmuxConfigBuilder::new().max_history(3).build();
    let (mut m, _transport) = manager_with(config);
    m.set_policy(|_: &ReconnectEvent| ReconnectDecision::RetryNow);
    let d = device();

    m.connect(&d);
    for _ in 0..5 {
        m.tick(STEP);
        assert!(m.scheduler().is_current(OperationKind::Connect, &d.clone().into()));
        m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 133));
    }

    let counts: Vec<u32> = m.history(&d).iter().map(|f| f.failure_count).collect();
    assert_eq!(counts, vec![3, 4, 5]);
}

#[test]
fn test_history_resets_to_one_after_initialized() {
    let (mut m, _transport) = manager();
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 133));
    ticks(&mut m, 51);
    assert!(m.scheduler().is_current(OperationKind::Connect, &d.clone().into()));
    m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 133));
    assert_eq!(m.history(&d).len(), 2);

    ticks(&mut m, 51);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Connect));
    m.on_native_event(NativeEvent::success(&d, OperationKind::DiscoverServices));
    assert!(m.is(&d, DeviceState::Initialized));
    assert!(!m.is(&d, DeviceState::ConnectingOverall));

    let history = m.history(&d);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].failure_count, 2);

    // a drop starts the next cycle with that single entry
    m.on_native_event(NativeEvent::ConnectionLost {
        device: d.clone(),
        status: 8,
    });
    assert!(m.is(&d, DeviceState::ConnectingOverall));
    assert_eq!(m.history(&d).len(), 1);

    // and its failure count starts over
    m.tick(STEP);
    m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 133));
    let history = m.history(&d);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].failure_count, 1);
}

#[test]
fn test_clean_connect_leaves_history_empty() {
    let (mut m, _transport) = manager();
    let d = device();
    initialized(&mut m, &d);
    assert!(m.history(&d).is_empty());
    assert!(m.is_idle());
}

// ============================================================================
// Non-retry categories
// ============================================================================

fn counting_policy(m: &mut DeviceManager<MockTransport>) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    m.set_policy(move |_: &ReconnectEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
        ReconnectDecision::RetryNow
    });
    calls
}

#[test]
fn test_explicit_disconnect_never_consults_policy() {
    let (mut m, transport) = manager();
    let calls = counting_policy(&mut m);
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.disconnect(&d).unwrap();
    assert_eq!(transport.count(OperationKind::Disconnect), 1);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Disconnect));

    let events = m.drain_events();
    assert_eq!(connect_fails(&events), vec![ConnectFailCategory::ExplicitDisconnect]);
    assert_eq!(ended(&events, OperationKind::Connect), vec![OperationState::Cancelled]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(!m.is(&d, DeviceState::ConnectingOverall));
    assert!(m.history(&d).is_empty());
}

#[test]
fn test_adapter_off_never_consults_policy() {
    let (mut m, transport) = manager();
    let calls = counting_policy(&mut m);
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.adapter_turning_off();

    let events = m.drain_events();
    assert_eq!(connect_fails(&events), vec![ConnectFailCategory::AdapterTurningOff]);
    assert_eq!(ended(&events, OperationKind::Connect), vec![OperationState::Cancelled]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(m.state(&d), Some(gattmux_core::StateSet::disconnected()));
    assert_eq!(m.device(&d).unwrap().intent(), Intent::Unintentional);
    assert_eq!(transport.count(OperationKind::TurnAdapterOff), 1);
}

#[test]
fn test_adapter_off_keeps_bond_and_clears_queue() {
    let (mut m, _transport) = manager();
    let d = device();
    initialized(&mut m, &d);
    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonded,
        status: 0,
    });
    m.read(&d, attr()).unwrap();
    m.read_rssi(&d).unwrap();

    m.adapter_turning_off();
    assert!(m.is(&d, DeviceState::Bonded));
    assert!(m.is(&d, DeviceState::Disconnected));
    assert_eq!(m.scheduler().queue_len(), 0);
    assert!(m
        .scheduler()
        .is_current(OperationKind::TurnAdapterOff, &gattmux_core::Target::Adapter));
}

#[test]
fn test_connect_while_connecting_is_refused() {
    let (mut m, transport) = manager();
    let d = device();

    assert!(m.connect(&d).is_some());
    assert!(m.connect(&d).is_none());
    m.tick(STEP);

    let events = m.drain_events();
    assert_eq!(
        connect_fails(&events),
        vec![ConnectFailCategory::AlreadyConnectingOrConnected]
    );
    assert_eq!(transport.count(OperationKind::Connect), 1);
    assert!(m.history(&d).is_empty());
}

// ============================================================================
// Giving up
// ============================================================================

/// Fail every connect attempt until the cycle ends
fn fail_until_done(m: &mut DeviceManager<MockTransport>, d: &DeviceId, until: DeviceState) {
    for _ in 0..2_000 {
        if !m.is(d, DeviceState::ConnectingOverall) || m.is(d, until) {
            return;
        }
        m.tick(STEP);
        if m.scheduler().is_current(OperationKind::Connect, &d.clone().into()) {
            m.on_native_event(NativeEvent::failure(d, OperationKind::Connect, 133));
        }
    }
    panic!("connect cycle never ended");
}

#[test]
fn test_short_term_gives_up_after_timeout() {
    let (mut m, transport) = manager();
    let d = device();

    m.connect(&d);
    fail_until_done(&mut m, &d, DeviceState::ReconnectingLongTerm);

    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(!m.is_any(
        &d,
        &[
            DeviceState::ConnectingOverall,
            DeviceState::ReconnectingShortTerm,
            DeviceState::Connecting
        ]
    ));
    assert!(m.clock() <= Duration::from_millis(5_100));
    assert!(transport.count(OperationKind::Connect) >= 4);

    let history = m.history(&d);
    assert_eq!(history.len(), 1);
    assert!(history[0].failure_count >= 4);
    assert!(m.is_idle());
}

#[test]
fn test_long_term_follows_short_term() {
    let config = GattmuxConfigBuilder::new()
        .short_term(Duration::from_secs(1), Duration::from_secs(2))
        .long_term(Duration::from_secs(3), Duration::from_secs(60))
        .build();
    let (mut m, _transport) = manager_with(config);
    let d = device();

    m.connect(&d);
    fail_until_done(&mut m, &d, DeviceState::ReconnectingLongTerm);

    assert!(m.is(&d, DeviceState::ConnectingOverall));
    assert!(m.is(&d, DeviceState::ReconnectingLongTerm));
    assert!(!m.is(&d, DeviceState::ReconnectingShortTerm));

    let events = m.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::ReconnectScheduled { phase: ReconnectPhase::LongTerm, delay, .. }
            if *delay == Duration::from_secs(3)
    )));
    assert_eq!(
        m.device(&d).unwrap().snapshot().reconnect_phase,
        Some(ReconnectPhase::LongTerm)
    );
}

#[test]
fn test_reconnect_disabled_gives_up_on_first_failure() {
    let config = GattmuxConfigBuilder::new().reconnect(false).build();
    let (mut m, _transport) = manager_with(config);
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::failure(&d, OperationKind::Connect, 133));

    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(!m.is(&d, DeviceState::ConnectingOverall));
    assert_eq!(m.history(&d).len(), 1);
}

// ============================================================================
// Failures after the link is up
// ============================================================================

#[test]
fn test_discovery_failure_disconnects_then_retries() {
    let (mut m, transport) = manager();
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Connect));
    assert!(m.scheduler().is_current(OperationKind::DiscoverServices, &d.clone().into()));

    m.on_native_event(NativeEvent::failure(&d, OperationKind::DiscoverServices, 129));
    let history = m.history(&d);
    assert_eq!(history[0].category, ConnectFailCategory::DiscoveringServicesFailed);
    assert_eq!(
        history[0].highest_state_reached,
        Some(DeviceState::DiscoveringServices)
    );

    m.tick(STEP);
    assert_eq!(transport.count(OperationKind::Disconnect), 1);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Disconnect));
    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(m.is(&d, DeviceState::ConnectingOverall));
    assert_eq!(m.device(&d).unwrap().intent(), Intent::Unintentional);
}

#[test]
fn test_rogue_disconnect_mid_cycle() {
    let (mut m, _transport) = manager();
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Connect));
    m.on_native_event(NativeEvent::ConnectionLost {
        device: d.clone(),
        status: 19,
    });

    let events = m.drain_events();
    assert_eq!(
        ended(&events, OperationKind::DiscoverServices),
        vec![OperationState::Cancelled]
    );
    assert_eq!(connect_fails(&events), vec![ConnectFailCategory::RogueDisconnect]);
    assert!(m.is(&d, DeviceState::Disconnected));
    assert!(m.is(&d, DeviceState::ReconnectingShortTerm));
}

#[test]
fn test_link_loss_during_connect_fails_the_connect() {
    let (mut m, _transport) = manager();
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::ConnectionLost {
        device: d.clone(),
        status: 8,
    });

    let history = m.history(&d);
    assert_eq!(history[0].category, ConnectFailCategory::NativeConnectionFailed);
    assert_eq!(history[0].timing, Timing::TimedOut);
}

#[test]
fn test_drop_after_initialized_retries_immediately() {
    let (mut m, transport) = manager();
    let d = device();
    initialized(&mut m, &d);

    m.on_native_event(NativeEvent::ConnectionLost {
        device: d.clone(),
        status: 8,
    });
    assert!(m.is(&d, DeviceState::ReconnectingShortTerm));
    assert!(m.is(&d, DeviceState::Connecting));
    assert!(!m.is(&d, DeviceState::Initialized));

    m.tick(STEP);
    assert_eq!(transport.count(OperationKind::Connect), 2);
}

#[test]
fn test_operation_timeout_counts_as_failure() {
    let config = GattmuxConfigBuilder::new()
        .timeout_for(OperationKind::Connect, Some(Duration::from_millis(100)))
        .build();
    let (mut m, _transport) = manager_with(config);
    let d = device();

    m.connect(&d);
    ticks(&mut m, 7);

    let history = m.history(&d);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].timing, Timing::TimedOut);
    assert_eq!(history[0].native_status, None);
}

// ============================================================================
// Transactions
// ============================================================================

fn discovered(m: &mut DeviceManager<MockTransport>, d: &DeviceId, options: ConnectOptions) {
    m.connect_with(d, options);
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(d, OperationKind::Connect));
    m.on_native_event(NativeEvent::success(d, OperationKind::DiscoverServices));
}

#[test]
fn test_transaction_phases_lead_to_initialized() {
    let (mut m, _transport) = manager();
    let d = device();
    let options = ConnectOptions::plain()
        .with_authentication()
        .with_initialization();

    discovered(&mut m, &d, options);
    assert!(m.is(&d, DeviceState::Authenticating));
    assert!(matches!(
        m.complete_transaction(&d, TransactionPhase::Initialization, true),
        Err(GattmuxError::NotInTransaction { .. })
    ));

    m.complete_transaction(&d, TransactionPhase::Authentication, true)
        .unwrap();
    assert!(m.is(&d, DeviceState::Initializing));
    m.complete_transaction(&d, TransactionPhase::Initialization, true)
        .unwrap();
    assert!(m.is(&d, DeviceState::Initialized));
    assert!(!m.is(&d, DeviceState::ConnectingOverall));
}

#[test]
fn test_failed_transaction_read_is_attached_to_the_failure() {
    let (mut m, transport) = manager();
    let d = device();
    discovered(&mut m, &d, ConnectOptions::plain().with_authentication());

    m.read(&d, attr()).unwrap();
    m.tick(STEP);
    assert_eq!(transport.count(OperationKind::Read), 1);
    m.on_native_event(NativeEvent::failure(&d, OperationKind::Read, 5));

    m.complete_transaction(&d, TransactionPhase::Authentication, false)
        .unwrap();

    let history = m.history(&d);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, ConnectFailCategory::AuthenticationFailed);
    let failure = history[0].operation_failure.clone().unwrap();
    assert_eq!(failure.kind, OperationKind::Read);
    assert_eq!(failure.state, OperationState::Failed);
    assert_eq!(failure.native_status, Some(5));
    assert!(!m.is(&d, DeviceState::Authenticating));
    assert!(m
        .scheduler()
        .is_pending(OperationKind::Disconnect, &d.clone().into()));
}

#[test]
fn test_reads_on_disconnected_device_fail_immediately() {
    let (mut m, transport) = manager();
    let d = device();
    m.add_device(d.clone());

    m.read(&d, attr()).unwrap();
    let events = m.drain_events();
    assert_eq!(
        ended(&events, OperationKind::Read),
        vec![OperationState::FailedImmediately]
    );
    assert_eq!(transport.count(OperationKind::Read), 0);
    assert!(matches!(
        m.read(&DeviceId::parse("C0:FF:EE:00:00:99").unwrap(), attr()),
        Err(GattmuxError::UnknownDevice(_))
    ));
}

// ============================================================================
// Bonding
// ============================================================================

#[test]
fn test_bond_on_connect_runs_before_discovery() {
    let config = GattmuxConfigBuilder::new().bond_on_connect(true).build();
    let (mut m, transport) = manager_with(config);
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Connect));
    assert_eq!(
        transport.call_kinds(),
        vec![OperationKind::Connect, OperationKind::Bond]
    );
    assert!(m.is(&d, DeviceState::Bonding));

    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonded,
        status: 0,
    });
    assert!(m.is(&d, DeviceState::Bonded));
    assert_eq!(
        transport.call_kinds(),
        vec![
            OperationKind::Connect,
            OperationKind::Bond,
            OperationKind::DiscoverServices
        ]
    );
}

#[test]
fn test_bond_failure_during_connect_is_classified() {
    let config = GattmuxConfigBuilder::new().bond_on_connect(true).build();
    let (mut m, _transport) = manager_with(config);
    let d = device();

    m.connect(&d);
    m.tick(STEP);
    m.on_native_event(NativeEvent::success(&d, OperationKind::Connect));
    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::None,
        status: 9,
    });

    let history = m.history(&d);
    assert_eq!(history[0].category, ConnectFailCategory::BondingFailed);
    assert_eq!(history[0].bond_fail_reason, Some(9));
    assert!(!m.is(&d, DeviceState::Bonding));
}

#[test]
fn test_remote_bond_request_interrupts_write() {
    let (mut m, transport) = manager();
    let d = device();
    initialized(&mut m, &d);
    m.drain_events();

    m.write(&d, attr(), vec![0x01, 0x02]).unwrap();
    m.tick(STEP);
    assert!(m.scheduler().is_current(OperationKind::Write, &d.clone().into()));

    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonding,
        status: 0,
    });
    assert!(m.scheduler().is_current(OperationKind::Bond, &d.clone().into()));

    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonded,
        status: 0,
    });
    assert!(m.is(&d, DeviceState::Bonded));
    assert!(m.scheduler().is_current(OperationKind::Write, &d.clone().into()));
    assert_eq!(transport.count(OperationKind::Write), 2);

    let events = m.drain_events();
    assert_eq!(
        ended(&events, OperationKind::Write),
        vec![OperationState::Interrupted]
    );
}

#[test]
fn test_interrupted_write_callback_sees_resumed_failure() {
    let (mut m, _transport) = manager();
    let d = device();
    initialized(&mut m, &d);
    m.drain_events();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    m.submit(
        Operation::write(&d, attr(), vec![0x01])
            .on_complete(move |c| log.lock().push((c.state, c.native_status))),
    )
    .unwrap();
    m.tick(STEP);

    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonding,
        status: 0,
    });
    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonded,
        status: 0,
    });
    assert!(seen.lock().is_empty());
    assert!(m.scheduler().is_current(OperationKind::Write, &d.clone().into()));

    m.on_native_event(NativeEvent::failure(&d, OperationKind::Write, 133));

    assert_eq!(*seen.lock(), vec![(OperationState::Failed, Some(133))]);
    let events = m.drain_events();
    assert_eq!(
        ended(&events, OperationKind::Write),
        vec![OperationState::Interrupted, OperationState::Failed]
    );
}

#[test]
fn test_explicit_bond_and_unbond() {
    let (mut m, _transport) = manager();
    let d = device();
    initialized(&mut m, &d);

    m.bond(&d).unwrap();
    m.tick(STEP);
    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::Bonded,
        status: 0,
    });
    assert!(m.is(&d, DeviceState::Bonded));

    m.unbond(&d).unwrap();
    m.tick(STEP);
    m.on_native_event(NativeEvent::BondStateChanged {
        device: d.clone(),
        state: BondState::None,
        status: 0,
    });
    assert!(!m.is_any(&d, &[DeviceState::Bonded, DeviceState::Bonding]));
}

#[test]
fn test_snapshot_is_ordered_and_serializable() {
    let (mut m, _transport) = manager();
    m.add_device(DeviceId::parse("00:00:00:00:00:02").unwrap());
    m.add_device(DeviceId::parse("00:00:00:00:00:01").unwrap());

    let snapshot = m.snapshot();
    assert_eq!(snapshot[0].device.as_str(), "00:00:00:00:00:01");
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("DISCONNECTED"));
}
