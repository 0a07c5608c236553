//! Property-style tests for the scheduler
//!
//! These tests drive the scheduler through seeded random sequences of
//! enqueue / tick / end calls and check:
//! - Single flight: the executor is never asked to start an operation while
//!   another one is executing
//! - Ordinal monotonicity and FIFO order among equal priorities per target
//! - Exactly one completion callback per operation
//! - Cancelled operations are notified before their canceller ends
//! - Interrupted operations report the outcome of their resumed run

use bytes::Bytes;
use gattmux_core::{
    AttributeId, DeviceId, OperationKind, OperationState, Priority, SchedulerConfig, Target,
    TimeoutConfig,
};
use gattmux_scheduler::{Execution, Executor, OpId, Operation, Scheduler};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Helpers
// ============================================================================

const STEP: Duration = Duration::from_millis(20);

/// Executor that tracks how many operations it believes are in flight
#[derive(Default)]
struct FlightRecorder {
    in_flight: usize,
    max_in_flight: usize,
    started: Vec<(OpId, Target, Priority)>,
}

impl Executor for FlightRecorder {
    fn is_armable(&self, _op: &Operation) -> bool {
        true
    }

    fn execute(&mut self, op: &Operation) -> Execution {
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        if let Some(id) = op.id() {
            self.started.push((id, op.target().clone(), op.priority()));
        }
        Execution::Started
    }
}

fn device(n: u8) -> DeviceId {
    DeviceId::parse(&format!("00:00:00:00:00:{:02X}", n)).unwrap()
}

fn attr() -> AttributeId {
    AttributeId::characteristic(Uuid::from_u128(0x180F), Uuid::from_u128(0x2A19))
}

type CallbackLog = Arc<Mutex<Vec<(OpId, OperationState)>>>;

fn logged(op: Operation, log: &CallbackLog, id_slot: Arc<Mutex<Option<OpId>>>) -> Operation {
    let log = log.clone();
    op.on_complete(move |c| {
        *id_slot.lock() = Some(c.id);
        log.lock().push((c.id, c.state));
    })
}

fn random_op(rng: &mut StdRng) -> Operation {
    let d = device(rng.gen_range(0..3));
    let op = match rng.gen_range(0..4) {
        0 => Operation::read(&d, attr()),
        1 => Operation::write(&d, attr(), vec![rng.gen::<u8>()]),
        2 => Operation::read_rssi(&d),
        _ => Operation::read_descriptor(&d, attr()),
    };
    let priority = match rng.gen_range(0..3) {
        0 => Priority::Low,
        1 => Priority::NORMAL,
        _ => Priority::Medium,
    };
    op.with_priority(priority)
}

// ============================================================================
// Random sequences
// ============================================================================

#[test]
fn test_single_flight_and_fifo_under_random_sequences() {
    for seed in 0..50u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
        let mut exec = FlightRecorder::default();
        let log: CallbackLog = Arc::new(Mutex::new(Vec::new()));
        let mut enqueued: Vec<OpId> = Vec::new();

        for _ in 0..200 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let op = logged(random_op(&mut rng), &log, Arc::new(Mutex::new(None)));
                    let id = scheduler.enqueue(op);
                    if let Some(last) = enqueued.last() {
                        assert!(*last < id, "ordinals must increase");
                    }
                    enqueued.push(id);
                }
                5..=7 => scheduler.tick(STEP, &mut exec),
                _ => {
                    let state = if rng.gen_bool(0.8) {
                        OperationState::Succeeded
                    } else {
                        OperationState::Failed
                    };
                    if scheduler.end_current(state, None, Bytes::new()).is_some() {
                        exec.in_flight -= 1;
                    }
                    while scheduler.pump(&mut exec) {}
                }
            }
            assert!(exec.in_flight <= 1);
        }

        assert_eq!(exec.max_in_flight, 1, "seed {}", seed);

        // FIFO among equal priority and equal target
        let mut last_seen: HashMap<(Target, Priority), OpId> = HashMap::new();
        for (id, target, priority) in &exec.started {
            if let Some(prev) = last_seen.insert((target.clone(), *priority), *id) {
                assert!(prev < *id, "seed {}: {} started after {}", seed, prev, id);
            }
        }

        // drain and check one callback per operation
        scheduler.clear_queue_matching(|_| true);
        if scheduler.current().is_some() {
            scheduler.end_current(OperationState::Succeeded, None, Bytes::new());
        }
        let mut counts: HashMap<OpId, usize> = HashMap::new();
        for (id, _) in log.lock().iter() {
            *counts.entry(*id).or_default() += 1;
        }
        for id in &enqueued {
            assert_eq!(counts.get(id), Some(&1), "seed {}: {} callbacks", seed, id);
        }
    }
}

// ============================================================================
// Displacement ordering
// ============================================================================

#[test]
fn test_cancelled_operation_notified_before_canceller_ends() {
    let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
    let mut exec = FlightRecorder::default();
    let log: CallbackLog = Arc::new(Mutex::new(Vec::new()));
    let d = device(1);

    let connect = scheduler.enqueue(logged(
        Operation::connect(&d, true),
        &log,
        Arc::new(Mutex::new(None)),
    ));
    scheduler.tick(STEP, &mut exec);

    let disconnect = scheduler.enqueue(logged(
        Operation::disconnect(&d, false),
        &log,
        Arc::new(Mutex::new(None)),
    ));
    assert!(scheduler.pump(&mut exec));
    scheduler.end_current(OperationState::Succeeded, Some(0), Bytes::new());

    let log = log.lock().clone();
    assert_eq!(
        log,
        vec![
            (connect, OperationState::Cancelled),
            (disconnect, OperationState::Succeeded)
        ]
    );
}

#[test]
fn test_interrupted_operation_reports_resumed_outcome_once() {
    let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
    let mut exec = FlightRecorder::default();
    let log: CallbackLog = Arc::new(Mutex::new(Vec::new()));
    let d = device(2);

    let write = scheduler.enqueue(logged(
        Operation::write(&d, attr(), vec![0x01]),
        &log,
        Arc::new(Mutex::new(None)),
    ));
    scheduler.tick(STEP, &mut exec);

    let bond = scheduler.enqueue(logged(
        Operation::bond(&d, false),
        &log,
        Arc::new(Mutex::new(None)),
    ));
    let interrupted = scheduler.take_completed();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].id, write);
    assert_eq!(interrupted[0].state, OperationState::Interrupted);

    assert!(scheduler.pump(&mut exec));
    assert!(scheduler.is_current(OperationKind::Bond, &d.clone().into()));
    scheduler.end_current(OperationState::Succeeded, Some(0), Bytes::new());

    // the write runs again afterwards under the same ordinal
    assert!(scheduler.pump(&mut exec));
    assert_eq!(scheduler.current().and_then(|op| op.id()), Some(write));
    scheduler.end_current(OperationState::Failed, Some(133), Bytes::new());

    let log = log.lock().clone();
    assert_eq!(
        log,
        vec![
            (bond, OperationState::Succeeded),
            (write, OperationState::Failed)
        ]
    );
}

#[test]
fn test_interrupted_operation_cleared_before_resuming_reports_once() {
    let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
    let mut exec = FlightRecorder::default();
    let log: CallbackLog = Arc::new(Mutex::new(Vec::new()));
    let d = device(2);

    let write = scheduler.enqueue(logged(
        Operation::write(&d, attr(), vec![0x01]),
        &log,
        Arc::new(Mutex::new(None)),
    ));
    scheduler.tick(STEP, &mut exec);
    scheduler.enqueue(Operation::bond(&d, false));
    scheduler.clear_queue_of(OperationKind::Write, &d.clone().into());

    assert_eq!(*log.lock(), vec![(write, OperationState::ClearedFromQueue)]);
}

#[test]
fn test_adapter_off_preempts_everything() {
    let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
    let mut exec = FlightRecorder::default();
    let d = device(3);

    scheduler.enqueue(Operation::read(&d, attr()));
    scheduler.enqueue(Operation::connect(&device(4), true));
    scheduler.tick(STEP, &mut exec);
    assert!(scheduler.is_current(OperationKind::Connect, &device(4).into()));

    scheduler.enqueue(Operation::turn_adapter_off());
    let done = scheduler.take_completed();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].state, OperationState::Cancelled);

    assert!(scheduler.pump(&mut exec));
    assert!(scheduler.is_current(OperationKind::TurnAdapterOff, &Target::Adapter));
    assert_eq!(scheduler.position_in_queue(OperationKind::Read, &d.into()), Some(0));
}

#[test]
fn test_unconfirmed_adapter_off_times_out_and_frees_the_slot() {
    let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
    let mut exec = FlightRecorder::default();
    let d = device(3);

    scheduler.enqueue(Operation::turn_adapter_off());
    scheduler.enqueue(Operation::read(&d, attr()));
    scheduler.tick(STEP, &mut exec);
    assert!(scheduler.is_current(OperationKind::TurnAdapterOff, &Target::Adapter));

    // 10s at 20ms per tick
    for _ in 0..499 {
        scheduler.tick(STEP, &mut exec);
    }
    assert!(scheduler.is_current(OperationKind::TurnAdapterOff, &Target::Adapter));

    scheduler.tick(STEP, &mut exec);
    let done = scheduler.take_completed();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].kind, OperationKind::TurnAdapterOff);
    assert_eq!(done[0].state, OperationState::TimedOut);

    scheduler.tick(STEP, &mut exec);
    assert!(scheduler.is_current(OperationKind::Read, &d.into()));
}
