//! Connection state machines for every device, around one scheduler
//!
//! The manager is the single update context: every API call, native event
//! and tick mutates it synchronously and then settles, handling operation
//! completions and pumping the scheduler until nothing more can happen in
//! the current pass.

use bytes::Bytes;
use gattmux_core::{
    AttributeId, BondState, ConnectFailCategory, ConnectFailEvent, DeviceEvent, DeviceId,
    DeviceState, GattmuxConfig, GattmuxError, Intent, NativeEvent, NativeOutcome,
    OperationFailure, OperationKind, OperationState, ReconnectPhase, Result, StateSet, Target,
    Timing, Transport,
};
use gattmux_scheduler::{Completion, OpId, Operation, Scheduler};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::cycle::{ConnectCycle, ConnectOptions, TransactionPhase};
use crate::device::{Device, DeviceSnapshot};
use crate::executor::DeviceExecutor;
use crate::policy::{
    DefaultReconnectPolicy, ReconnectDecision, ReconnectEvent, ReconnectPolicy,
    ReconnectQuestion,
};

use DeviceState::*;

/// Flags owned by a running connect cycle
const CYCLE_FLAGS: [DeviceState; 3] = [
    ConnectingOverall,
    ReconnectingShortTerm,
    ReconnectingLongTerm,
];

/// Steps of an attempt that end with it
const ATTEMPT_FLAGS: [DeviceState; 4] = [
    Connecting,
    DiscoveringServices,
    Authenticating,
    Initializing,
];

/// Flags that need a live link
const LIVE_FLAGS: [DeviceState; 5] = [
    Connected,
    DiscoveringServices,
    Authenticating,
    Initializing,
    Initialized,
];

fn reconnecting_flag(phase: ReconnectPhase) -> DeviceState {
    match phase {
        ReconnectPhase::ShortTerm => ReconnectingShortTerm,
        ReconnectPhase::LongTerm => ReconnectingLongTerm,
    }
}

fn cycle_intent(device: &Device) -> Intent {
    match device.cycle() {
        Some(cycle) if cycle.is_explicit() => Intent::Intentional,
        _ => Intent::Unintentional,
    }
}

fn unknown(id: &DeviceId) -> GattmuxError {
    GattmuxError::UnknownDevice(id.to_string())
}

/// How a connect attempt went wrong
struct AttemptFailure {
    category: ConnectFailCategory,
    timing: Timing,
    native_status: Option<i32>,
    bond_fail_reason: Option<i32>,
    operation_failure: Option<OperationFailure>,
}

impl AttemptFailure {
    fn new(category: ConnectFailCategory, timing: Timing, native_status: Option<i32>) -> Self {
        Self {
            category,
            timing,
            native_status,
            bond_fail_reason: None,
            operation_failure: None,
        }
    }
}

/// Owns the scheduler, the transport and every device
pub struct DeviceManager<T: Transport> {
    config: GattmuxConfig,
    scheduler: Scheduler,
    devices: HashMap<DeviceId, Device>,
    transport: T,
    policy: Box<dyn ReconnectPolicy>,
    events: Vec<DeviceEvent>,
    clock: Duration,
}

impl<T: Transport> DeviceManager<T> {
    /// Create a manager. Fails if the configuration does not validate.
    pub fn new(config: GattmuxConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(&config.scheduler, config.timeouts.clone());
        let policy = Box::new(DefaultReconnectPolicy::new(&config.reconnect));
        info!(transport = transport.name(), "Device manager created");

        Ok(Self {
            config,
            scheduler,
            devices: HashMap::new(),
            transport,
            policy,
            events: Vec::new(),
            clock: Duration::ZERO,
        })
    }

    /// Replace the reconnect policy for all devices without an override
    pub fn set_policy(&mut self, policy: impl ReconnectPolicy + 'static) {
        self.policy = Box::new(policy);
    }

    /// Give one device its own reconnect policy
    pub fn set_device_policy(
        &mut self,
        id: &DeviceId,
        policy: impl ReconnectPolicy + 'static,
    ) -> Result<()> {
        let device = self.devices.get_mut(id).ok_or_else(|| unknown(id))?;
        device.policy = Some(Box::new(policy));
        Ok(())
    }

    /// Register a device, or return the one already known
    pub fn add_device(&mut self, id: DeviceId) -> &Device {
        let bound = self.config.history.bound();
        self.devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(id, bound))
    }

    // ----- connection lifecycle -----

    /// Start a connect cycle with no transaction phases
    pub fn connect(&mut self, id: &DeviceId) -> Option<OpId> {
        self.connect_with(id, ConnectOptions::default())
    }

    /// Start a connect cycle.
    ///
    /// Returns `None` when the device is already connecting or connected; a
    /// ConnectFail with ALREADY_CONNECTING_OR_CONNECTED is emitted instead.
    pub fn connect_with(&mut self, id: &DeviceId, options: ConnectOptions) -> Option<OpId> {
        self.scheduler.begin_pass();
        let now = self.clock;
        let disconnecting = self
            .scheduler
            .is_pending(OperationKind::Disconnect, &Target::from(id));
        self.add_device(id.clone());
        let device = self.devices.get_mut(id)?;

        if device.is(ConnectingOverall) || (device.is(Connected) && !disconnecting) {
            info!(device = %id, state = %device.state(), "Already connecting or connected");
            let mut event = ConnectFailEvent::bare(
                id.clone(),
                ConnectFailCategory::AlreadyConnectingOrConnected,
                Timing::NotApplicable,
            );
            event.highest_state_reached = device.state().highest_connection_state();
            self.events.push(DeviceEvent::ConnectFail(event));
            return None;
        }

        info!(device = %id, ?options, "Connecting");
        device.options = options;
        device.last_transaction_failure = None;
        device.cycle = Some(ConnectCycle::new(now, true));
        let changed = device.update(Intent::Intentional, None, |s| {
            s.remove(Disconnected);
            s.insert(ConnectingOverall);
            s.insert(Connecting);
        });
        self.events.extend(changed);

        let op = self.scheduler.enqueue(Operation::connect(id, true));
        self.settle();
        Some(op)
    }

    /// Disconnect on purpose.
    ///
    /// Cancels queued connects and ends any running connect cycle without
    /// consulting the reconnect policy. The device stops being INITIALIZED
    /// at once but stays CONNECTED until the Disconnect ends.
    pub fn disconnect(&mut self, id: &DeviceId) -> Result<OpId> {
        self.scheduler.begin_pass();
        let now = self.clock;
        let target = Target::from(id);
        let device = self.devices.get_mut(id).ok_or_else(|| unknown(id))?;

        self.scheduler
            .cancel_queued_of(OperationKind::Connect, &target);

        if device.is(ConnectingOverall) {
            let event = Self::cycle_fail_event(
                device,
                ConnectFailCategory::ExplicitDisconnect,
                Timing::NotApplicable,
                now,
            );
            info!(device = %id, failures = event.failure_count, "Connect cycle ended by disconnect");
            self.events.push(DeviceEvent::ConnectFail(event));
        }

        device.cycle = None;
        device.ledger.compact();
        device.last_transaction_failure = None;
        // CONNECTED stays until the Disconnect ends
        let changed = device.update(Intent::Intentional, None, |s| {
            s.remove_all(&CYCLE_FLAGS);
            s.remove_all(&ATTEMPT_FLAGS);
            s.remove(Initialized);
            if !s.contains(Connected) {
                s.insert(Disconnected);
            }
        });
        self.events.extend(changed);

        info!(device = %id, "Disconnecting");
        let op = self.scheduler.enqueue(Operation::disconnect(id, true));
        self.settle();
        Ok(op)
    }

    /// Finish an authentication or initialization phase
    pub fn complete_transaction(
        &mut self,
        id: &DeviceId,
        phase: TransactionPhase,
        succeeded: bool,
    ) -> Result<()> {
        self.scheduler.begin_pass();
        let device = self.devices.get_mut(id).ok_or_else(|| unknown(id))?;
        if !device.is(phase.state()) {
            return Err(GattmuxError::NotInTransaction {
                device: id.to_string(),
                phase: phase.to_string(),
            });
        }

        if succeeded {
            let next = match phase {
                TransactionPhase::Authentication if device.options.initialize => {
                    Some(Initializing)
                }
                _ => None,
            };
            info!(device = %id, phase = %phase, "Transaction phase completed");
            let intent = cycle_intent(device);
            let changed = device.update(intent, None, |s| {
                s.remove(phase.state());
                if let Some(next) = next {
                    s.insert(next);
                }
            });
            self.events.extend(changed);
            if next.is_none() {
                self.on_initialized(id);
            }
        } else {
            let category = match phase {
                TransactionPhase::Authentication => ConnectFailCategory::AuthenticationFailed,
                TransactionPhase::Initialization => ConnectFailCategory::InitializationFailed,
            };
            let operation_failure = device.last_transaction_failure.take();
            let timing = operation_failure
                .as_ref()
                .map(|f| Timing::from_operation_state(f.state))
                .unwrap_or(Timing::NotApplicable);
            let native_status = operation_failure.as_ref().and_then(|f| f.native_status);
            self.connect_failed(
                id,
                AttemptFailure {
                    operation_failure,
                    ..AttemptFailure::new(category, timing, native_status)
                },
            );
        }

        self.settle();
        Ok(())
    }

    /// Turn the adapter off: cancel everything and settle every device in
    /// DISCONNECTED
    pub fn adapter_turning_off(&mut self) {
        info!(devices = self.devices.len(), "Adapter turning off");
        self.scheduler.begin_pass();
        let now = self.clock;

        self.scheduler.enqueue(Operation::turn_adapter_off());
        self.scheduler
            .clear_queue_matching(|op| op.kind() != OperationKind::TurnAdapterOff);

        for device in self.devices.values_mut() {
            if device.is(ConnectingOverall) {
                let event = Self::cycle_fail_event(
                    device,
                    ConnectFailCategory::AdapterTurningOff,
                    Timing::NotApplicable,
                    now,
                );
                self.events.push(DeviceEvent::ConnectFail(event));
            }
            device.cycle = None;
            device.ledger.compact();
            device.last_transaction_failure = None;
            let changed = device.update(Intent::Unintentional, None, |s| {
                let bonded = s.contains(Bonded);
                *s = StateSet::disconnected();
                if bonded {
                    s.insert(Bonded);
                }
            });
            self.events.extend(changed);
        }

        self.settle();
    }

    // ----- bonding -----

    /// Bond on request
    pub fn bond(&mut self, id: &DeviceId) -> Result<OpId> {
        self.scheduler.begin_pass();
        let device = self.devices.get_mut(id).ok_or_else(|| unknown(id))?;
        if !device.is(Bonded) {
            let changed = device.update(Intent::Intentional, None, |s| s.insert(Bonding));
            self.events.extend(changed);
        }
        let op = self.scheduler.enqueue(Operation::bond(id, true));
        self.settle();
        Ok(op)
    }

    /// Remove a bond
    pub fn unbond(&mut self, id: &DeviceId) -> Result<OpId> {
        self.scheduler.begin_pass();
        if !self.devices.contains_key(id) {
            return Err(unknown(id));
        }
        let op = self.scheduler.enqueue(Operation::unbond(id));
        self.settle();
        Ok(op)
    }

    // ----- reads and writes -----

    /// Enqueue any operation against a known device (or the adapter).
    ///
    /// Attribute operations issued during AUTHENTICATING or INITIALIZING are
    /// made transactional. Operations that need a link to a device that is
    /// neither connected nor connecting end at once as FAILED_IMMEDIATELY.
    pub fn submit(&mut self, op: Operation) -> Result<OpId> {
        self.scheduler.begin_pass();
        let (transactional, unreachable) = match op.device() {
            Some(id) => {
                let device = self.devices.get(id).ok_or_else(|| unknown(id))?;
                (
                    op.kind().is_attribute_op()
                        && device.is_any(&[Authenticating, Initializing]),
                    op.kind().requires_connection()
                        && !device.is_any(&[Connected, ConnectingOverall]),
                )
            }
            None => (false, false),
        };

        let op = if transactional && !op.is_transactional() {
            op.transactional(true)
        } else {
            op
        };
        let id = self.scheduler.enqueue(op);
        if unreachable {
            debug!(op = %id, "Device is not connected");
            self.scheduler
                .end(id, OperationState::FailedImmediately, None, Bytes::new());
        }
        self.settle();
        Ok(id)
    }

    /// Read a characteristic
    pub fn read(&mut self, id: &DeviceId, attribute: AttributeId) -> Result<OpId> {
        self.submit(Operation::read(id, attribute))
    }

    /// Write a characteristic
    pub fn write(
        &mut self,
        id: &DeviceId,
        attribute: AttributeId,
        data: impl Into<Bytes>,
    ) -> Result<OpId> {
        self.submit(Operation::write(id, attribute, data))
    }

    /// Read a descriptor
    pub fn read_descriptor(&mut self, id: &DeviceId, attribute: AttributeId) -> Result<OpId> {
        self.submit(Operation::read_descriptor(id, attribute))
    }

    /// Write a descriptor
    pub fn write_descriptor(
        &mut self,
        id: &DeviceId,
        attribute: AttributeId,
        data: impl Into<Bytes>,
    ) -> Result<OpId> {
        self.submit(Operation::write_descriptor(id, attribute, data))
    }

    /// Enable or disable notifications
    pub fn toggle_notify(
        &mut self,
        id: &DeviceId,
        attribute: AttributeId,
        enable: bool,
    ) -> Result<OpId> {
        self.submit(Operation::toggle_notify(id, attribute, enable))
    }

    /// Read the remote RSSI
    pub fn read_rssi(&mut self, id: &DeviceId) -> Result<OpId> {
        self.submit(Operation::read_rssi(id))
    }

    // ----- driving -----

    /// Advance time by `dt`
    pub fn tick(&mut self, dt: Duration) {
        self.clock += dt;
        let mut exec = DeviceExecutor::new(&self.devices, &mut self.transport);
        self.scheduler.tick(dt, &mut exec);
        self.settle();

        let waiting: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.cycle().is_some_and(|c| c.is_waiting()))
            .map(|d| d.id().clone())
            .collect();
        for id in waiting {
            self.advance_retry(&id, dt);
        }
        self.settle();
    }

    /// Handle a callback from the native stack
    pub fn on_native_event(&mut self, event: NativeEvent) {
        self.scheduler.begin_pass();
        match event {
            NativeEvent::Completed {
                target,
                kind,
                status,
                payload,
                ..
            } => {
                let state = NativeOutcome::classify(status).terminal_state();
                self.scheduler
                    .end_matching(kind, &target, state, Some(status), payload);
            }
            NativeEvent::ConnectionLost { device, status } => {
                self.on_connection_lost(&device, status)
            }
            NativeEvent::BondStateChanged {
                device,
                state,
                status,
            } => self.on_bond_state_changed(&device, state, status),
            NativeEvent::Notification {
                device,
                attribute,
                payload,
            } => {
                trace!(device = %device, bytes = payload.len(), "Notification");
                self.events.push(DeviceEvent::Notification {
                    device,
                    attribute,
                    payload: payload.to_vec(),
                });
            }
        }
        self.settle();
    }

    /// Take the events emitted since the last call
    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    // ----- queries -----

    /// Look up a device
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// All known devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Flags of a device
    pub fn state(&self, id: &DeviceId) -> Option<StateSet> {
        self.devices.get(id).map(|d| d.state())
    }

    /// Check one flag. Unknown devices have none.
    pub fn is(&self, id: &DeviceId, state: DeviceState) -> bool {
        self.devices.get(id).is_some_and(|d| d.is(state))
    }

    /// Check whether any of the flags is set
    pub fn is_any(&self, id: &DeviceId, states: &[DeviceState]) -> bool {
        self.devices.get(id).is_some_and(|d| d.is_any(states))
    }

    /// Failure history of a device, oldest first
    pub fn history(&self, id: &DeviceId) -> Vec<ConnectFailEvent> {
        self.devices
            .get(id)
            .map(|d| d.history())
            .unwrap_or_default()
    }

    /// Snapshot of every device, ordered by address
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self.devices.values().map(|d| d.snapshot()).collect();
        all.sort_by(|a, b| a.device.as_str().cmp(b.device.as_str()));
        all
    }

    /// Nothing queued, nothing executing and no connect cycle running
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && self.devices.values().all(|d| d.cycle().is_none())
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Configuration in use
    pub fn config(&self) -> &GattmuxConfig {
        &self.config
    }

    /// Time accumulated from ticks
    pub fn clock(&self) -> Duration {
        self.clock
    }

    // ----- internals -----

    fn settle(&mut self) {
        loop {
            for completion in self.scheduler.take_completed() {
                self.on_operation_ended(completion);
            }
            if self.scheduler.has_completed() {
                continue;
            }
            if !self.scheduler.wants_pump() {
                break;
            }
            let mut exec = DeviceExecutor::new(&self.devices, &mut self.transport);
            let dequeued = self.scheduler.pump(&mut exec);
            if !dequeued && !self.scheduler.has_completed() {
                break;
            }
        }
    }

    fn on_operation_ended(&mut self, c: Completion) {
        self.events.push(DeviceEvent::OperationEnded {
            target: c.target.clone(),
            kind: c.kind,
            attribute: c.attribute,
            state: c.state,
            native_status: c.native_status,
        });
        let Some(id) = c.device().cloned() else {
            return;
        };

        match c.kind {
            OperationKind::Connect => self.on_connect_ended(&id, &c),
            OperationKind::Disconnect => self.on_disconnect_ended(&id, &c),
            OperationKind::DiscoverServices => self.on_discovery_ended(&id, &c),
            OperationKind::Bond => self.on_bond_ended(&id, &c),
            OperationKind::Unbond => self.on_unbond_ended(&id, &c),
            kind if kind.is_attribute_op() && c.transactional && c.state.is_failure() => {
                if let Some(device) = self.devices.get_mut(&id) {
                    device.last_transaction_failure = Some(OperationFailure {
                        kind,
                        attribute: c.attribute,
                        state: c.state,
                        native_status: c.native_status,
                    });
                }
            }
            _ => {}
        }
    }

    fn on_connect_ended(&mut self, id: &DeviceId, c: &Completion) {
        match c.state {
            OperationState::Succeeded | OperationState::Redundant => {
                self.on_link_up(id, c.native_status)
            }
            state if state.is_failure() => self.connect_failed(
                id,
                AttemptFailure::new(
                    ConnectFailCategory::NativeConnectionFailed,
                    Timing::from_operation_state(state),
                    c.native_status,
                ),
            ),
            _ => {
                if self
                    .scheduler
                    .is_pending(OperationKind::Connect, &c.target)
                {
                    return;
                }
                if let Some(device) = self.devices.get_mut(id) {
                    let changed = device.update(device.intent(), None, |s| {
                        s.remove(Connecting);
                        if !s.contains(Connected) {
                            s.insert(Disconnected);
                        }
                    });
                    self.events.extend(changed);
                }
            }
        }
    }

    fn on_link_up(&mut self, id: &DeviceId, native_status: Option<i32>) {
        let bond_on_connect = self.config.device.bond_on_connect;
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };

        if device.is(Initialized) && device.cycle.is_some() {
            debug!(device = %id, "Link already initialized, closing the cycle");
            self.on_initialized(id);
            return;
        }
        if device.is_any(&[DiscoveringServices, Authenticating, Initializing, Initialized]) {
            let changed = device.update(device.intent(), None, |s| s.remove(Connecting));
            self.events.extend(changed);
            return;
        }

        let bond = bond_on_connect && !device.is_any(&[Bonded, Bonding]);
        info!(device = %id, bond, "Connected");
        let intent = cycle_intent(device);
        let changed = device.update(intent, native_status, |s| {
            s.remove(Connecting);
            s.insert(Connected);
            s.insert(DiscoveringServices);
            if bond {
                s.insert(Bonding);
            }
        });
        self.events.extend(changed);

        if bond {
            self.scheduler.enqueue(Operation::bond(id, false));
        }
        self.scheduler.enqueue(Operation::discover_services(id));
    }

    fn on_discovery_ended(&mut self, id: &DeviceId, c: &Completion) {
        match c.state {
            OperationState::Succeeded | OperationState::Redundant => {
                let Some(device) = self.devices.get_mut(id) else {
                    return;
                };
                if !device.is(Connected) {
                    debug!(device = %id, "Discovery finished after the link dropped");
                    return;
                }
                let next = device.options.first_phase();
                let intent = cycle_intent(device);
                let changed = device.update(intent, c.native_status, |s| {
                    s.remove(DiscoveringServices);
                    if let Some(next) = next {
                        s.insert(next);
                    }
                });
                self.events.extend(changed);

                match next {
                    Some(phase) => info!(device = %id, phase = %phase, "Services discovered"),
                    None => self.on_initialized(id),
                }
            }
            state if state.is_failure() => self.connect_failed(
                id,
                AttemptFailure::new(
                    ConnectFailCategory::DiscoveringServicesFailed,
                    Timing::from_operation_state(state),
                    c.native_status,
                ),
            ),
            _ => {}
        }
    }

    fn on_initialized(&mut self, id: &DeviceId) {
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let failures = device.cycle().map(|c| c.failure_count()).unwrap_or(0);
        let intent = cycle_intent(device);
        let changed = device.update(intent, None, |s| {
            s.remove_all(&CYCLE_FLAGS);
            s.remove_all(&ATTEMPT_FLAGS);
            s.insert(Initialized);
        });
        self.events.extend(changed);

        device.cycle = None;
        device.ledger.compact();
        device.last_transaction_failure = None;
        info!(device = %id, failures, "Device initialized");
    }

    fn on_disconnect_ended(&mut self, id: &DeviceId, c: &Completion) {
        if c.state.is_displaced() {
            return;
        }
        if c.state.is_failure() {
            warn!(device = %id, state = %c.state, "Disconnect failed; treating the link as down");
        }

        let intent = if c.explicit {
            Intent::Intentional
        } else {
            Intent::Unintentional
        };
        if let Some(device) = self.devices.get_mut(id) {
            let changed = device.update(intent, c.native_status, |s| {
                s.remove_all(&LIVE_FLAGS);
                if !s.contains(Connecting) {
                    s.insert(Disconnected);
                }
            });
            self.events.extend(changed);
        }

        let target = c.target.clone();
        self.scheduler
            .clear_queue_matching(|op| op.target() == &target && op.kind().requires_connection());
    }

    fn on_bond_ended(&mut self, id: &DeviceId, c: &Completion) {
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let intent = if c.explicit {
            Intent::Intentional
        } else {
            Intent::Unintentional
        };

        match c.state {
            OperationState::Succeeded | OperationState::Redundant => {
                info!(device = %id, "Bonded");
                let changed = device.update(intent, c.native_status, |s| {
                    s.remove(Bonding);
                    s.insert(Bonded);
                });
                self.events.extend(changed);
            }
            state if state.is_failure() => {
                let changed = device.update(intent, c.native_status, |s| s.remove(Bonding));
                self.events.extend(changed);

                if !c.explicit && device.is(ConnectingOverall) && device.is(Connected) {
                    self.connect_failed(
                        id,
                        AttemptFailure {
                            bond_fail_reason: c.native_status,
                            ..AttemptFailure::new(
                                ConnectFailCategory::BondingFailed,
                                Timing::from_operation_state(state),
                                c.native_status,
                            )
                        },
                    );
                } else {
                    warn!(device = %id, state = %state, status = ?c.native_status, "Bonding failed");
                }
            }
            _ => {
                let changed = device.update(intent, None, |s| s.remove(Bonding));
                self.events.extend(changed);
            }
        }
    }

    fn on_unbond_ended(&mut self, id: &DeviceId, c: &Completion) {
        if !matches!(c.state, OperationState::Succeeded | OperationState::Redundant) {
            return;
        }
        if let Some(device) = self.devices.get_mut(id) {
            info!(device = %id, "Unbonded");
            let changed = device.update(Intent::Intentional, c.native_status, |s| {
                s.remove_all(&[Bonding, Bonded]);
            });
            self.events.extend(changed);
        }
    }

    fn on_bond_state_changed(&mut self, id: &DeviceId, state: BondState, status: i32) {
        let target = Target::from(id);
        match state {
            BondState::Bonding => {
                if self.scheduler.is_pending(OperationKind::Bond, &target) {
                    return;
                }
                let Some(device) = self.devices.get_mut(id) else {
                    return;
                };
                info!(device = %id, "Remote side started bonding");
                let changed = device.update(Intent::Unintentional, Some(status), |s| {
                    s.insert(Bonding)
                });
                self.events.extend(changed);
                self.scheduler.enqueue(Operation::bond(id, false));
            }
            BondState::Bonded => {
                if self.scheduler.is_current(OperationKind::Bond, &target) {
                    self.scheduler
                        .end_current(OperationState::Succeeded, Some(status), Bytes::new());
                } else if let Some(device) = self.devices.get_mut(id) {
                    let changed = device.update(Intent::Unintentional, Some(status), |s| {
                        s.remove(Bonding);
                        s.insert(Bonded);
                    });
                    self.events.extend(changed);
                }
            }
            BondState::None => {
                if self.scheduler.is_current(OperationKind::Unbond, &target) {
                    self.scheduler
                        .end_current(OperationState::Succeeded, Some(status), Bytes::new());
                } else if self.scheduler.is_current(OperationKind::Bond, &target) {
                    self.scheduler
                        .end_current(OperationState::Failed, Some(status), Bytes::new());
                } else if let Some(device) = self.devices.get_mut(id) {
                    let changed = device.update(Intent::Unintentional, Some(status), |s| {
                        s.remove_all(&[Bonding, Bonded]);
                    });
                    self.events.extend(changed);
                }
            }
        }
    }

    fn on_connection_lost(&mut self, id: &DeviceId, status: i32) {
        let target = Target::from(id);
        if self.scheduler.is_current(OperationKind::Connect, &target) {
            let state = match NativeOutcome::classify(status) {
                NativeOutcome::Timeout => OperationState::TimedOut,
                _ => OperationState::Failed,
            };
            self.scheduler.end_current(state, Some(status), Bytes::new());
            return;
        }
        if self.scheduler.is_current(OperationKind::Disconnect, &target) {
            self.scheduler
                .end_current(OperationState::Succeeded, Some(status), Bytes::new());
            return;
        }

        let Some(device) = self.devices.get_mut(id) else {
            debug!(device = %id, "Link loss for an unknown device");
            return;
        };
        if !device.is(Connected) {
            debug!(device = %id, "Link loss while not connected");
            return;
        }

        let was_initialized = device.is(Initialized);
        let mid_cycle = device.is(ConnectingOverall);
        warn!(device = %id, status, mid_cycle, "Link lost");

        let changed = device.update(Intent::Unintentional, Some(status), |s| {
            s.remove_all(&LIVE_FLAGS);
            s.insert(Disconnected);
        });
        self.events.extend(changed);

        if self
            .scheduler
            .current()
            .is_some_and(|op| op.target() == &target && op.kind().requires_connection())
        {
            self.scheduler
                .end_current(OperationState::Cancelled, Some(status), Bytes::new());
        }
        self.scheduler
            .clear_queue_matching(|op| op.target() == &target && op.kind().requires_connection());

        if mid_cycle {
            self.connect_failed(
                id,
                AttemptFailure::new(
                    ConnectFailCategory::RogueDisconnect,
                    Timing::Eventually,
                    Some(status),
                ),
            );
        } else if was_initialized {
            self.begin_reconnect(id);
        }
    }

    fn begin_reconnect(&mut self, id: &DeviceId) {
        if !self.config.reconnect.enabled {
            info!(device = %id, "Reconnect disabled; staying disconnected");
            return;
        }
        let now = self.clock;
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        info!(device = %id, "Starting short-term reconnect");
        device.cycle = Some(ConnectCycle::new(now, false));
        device.last_transaction_failure = None;
        let changed = device.update(Intent::Unintentional, None, |s| {
            s.insert(ConnectingOverall);
            s.insert(ReconnectingShortTerm);
        });
        self.events.extend(changed);

        if let Some(decision) = self.decide(id, ReconnectQuestion::ShouldTryAgain, None) {
            self.apply_decision(id, decision);
        }
    }

    fn connect_failed(&mut self, id: &DeviceId, failure: AttemptFailure) {
        let now = self.clock;
        let target = Target::from(id);
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };

        let cycle = device
            .cycle
            .get_or_insert_with(|| ConnectCycle::new(now, false));
        let (count, latest, total) = cycle.record_failure(now);
        let mut event = ConnectFailEvent::bare(id.clone(), failure.category, failure.timing);
        event.failure_count = count;
        event.attempt_time_latest = latest;
        event.attempt_time_total = total;
        event.native_status = failure.native_status;
        event.bond_fail_reason = failure.bond_fail_reason;
        event.highest_state_reached = cycle.highest_attempt();
        event.highest_state_reached_total = cycle.highest_total();
        event.operation_failure = failure.operation_failure;

        warn!(
            device = %id,
            category = %event.category,
            timing = %event.timing,
            failures = count,
            status = ?event.native_status,
            "Connection attempt failed"
        );
        device.ledger.push(event.clone());
        self.events.push(DeviceEvent::ConnectFail(event.clone()));

        let link_up = device.is(Connected);
        let changed = device.update(Intent::Unintentional, failure.native_status, |s| {
            s.remove_all(&ATTEMPT_FLAGS);
            if !link_up {
                s.insert(Disconnected);
            }
        });
        self.events.extend(changed);

        if link_up && !self.scheduler.is_pending(OperationKind::Disconnect, &target) {
            self.scheduler.enqueue(Operation::disconnect(id, false));
        }

        if !event.allows_retry() || !self.config.reconnect.enabled {
            self.give_up(id);
            return;
        }
        if let Some(decision) = self.decide(id, ReconnectQuestion::ShouldTryAgain, Some(event)) {
            self.apply_decision(id, decision);
        }
    }

    fn decide(
        &self,
        id: &DeviceId,
        question: ReconnectQuestion,
        last_failure: Option<ConnectFailEvent>,
    ) -> Option<ReconnectDecision> {
        let device = self.devices.get(id)?;
        let cycle = device.cycle()?;
        let event = ReconnectEvent {
            device: id.clone(),
            question,
            phase: cycle.phase(),
            failure_count: cycle.failure_count(),
            phase_elapsed: cycle.phase_elapsed(self.clock),
            total_elapsed: cycle.total_elapsed(self.clock),
            previous_delay: cycle.previous_delay(),
            last_failure,
        };
        let policy = device.policy.as_deref().unwrap_or(&*self.policy);
        let decision = policy.decide(&event);
        match question {
            ReconnectQuestion::ShouldTryAgain => {
                debug!(device = %id, phase = %event.phase, decision = %decision, "Reconnect decision")
            }
            ReconnectQuestion::ShouldContinue => {
                trace!(device = %id, phase = %event.phase, decision = %decision, "Reconnect decision")
            }
        }
        Some(decision)
    }

    fn apply_decision(&mut self, id: &DeviceId, decision: ReconnectDecision) {
        let now = self.clock;
        let long_term_enabled = self.config.reconnect.long_term_enabled;
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let Some(cycle) = device.cycle.as_mut() else {
            return;
        };
        let phase = cycle.phase();

        match decision {
            ReconnectDecision::RetryNow => self.start_attempt(id),
            ReconnectDecision::RetryAfter(delay) => {
                cycle.schedule(delay);
                info!(device = %id, phase = %phase, delay = ?delay, "Reconnect scheduled");
                let changed = device.update(Intent::Unintentional, None, |s| {
                    s.insert(reconnecting_flag(phase))
                });
                self.events.extend(changed);
                self.events.push(DeviceEvent::ReconnectScheduled {
                    device: id.clone(),
                    phase,
                    delay,
                });
            }
            ReconnectDecision::Persist => {
                cycle.persist();
                let changed = device.update(Intent::Unintentional, None, |s| {
                    s.insert(reconnecting_flag(phase))
                });
                self.events.extend(changed);
            }
            ReconnectDecision::Stop => {
                if phase == ReconnectPhase::ShortTerm && long_term_enabled {
                    cycle.enter_phase(ReconnectPhase::LongTerm, now);
                    info!(device = %id, "Short-term reconnect gave up; switching to long-term");
                    let changed = device.update(Intent::Unintentional, None, |s| {
                        s.remove(ReconnectingShortTerm);
                        s.insert(ReconnectingLongTerm);
                    });
                    self.events.extend(changed);
                    if let Some(next) = self.decide(id, ReconnectQuestion::ShouldTryAgain, None) {
                        self.apply_decision(id, next);
                    }
                } else {
                    self.give_up(id);
                }
            }
        }
    }

    fn advance_retry(&mut self, id: &DeviceId, dt: Duration) {
        let Some(cycle) = self.devices.get_mut(id).and_then(|d| d.cycle.as_mut()) else {
            return;
        };
        if !cycle.is_waiting() {
            return;
        }
        let due = cycle.advance(dt);

        match self.decide(id, ReconnectQuestion::ShouldContinue, None) {
            Some(ReconnectDecision::Stop) => self.apply_decision(id, ReconnectDecision::Stop),
            Some(ReconnectDecision::RetryNow) => self.start_attempt(id),
            Some(ReconnectDecision::Persist | ReconnectDecision::RetryAfter(_)) if due => {
                self.start_attempt(id)
            }
            _ => {}
        }
    }

    fn start_attempt(&mut self, id: &DeviceId) {
        let target = Target::from(id);
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let Some(cycle) = device.cycle.as_mut() else {
            return;
        };
        cycle.begin_attempt();
        let phase = cycle.phase();
        debug!(
            device = %id,
            phase = %phase,
            attempt = cycle.failure_count() + 1,
            "Starting connection attempt"
        );

        let changed = device.update(Intent::Unintentional, None, |s| {
            s.insert(Connecting);
            s.insert(reconnecting_flag(phase));
            if !s.contains(Connected) {
                s.remove(Disconnected);
            }
        });
        self.events.extend(changed);

        if !self.scheduler.is_pending(OperationKind::Connect, &target) {
            self.scheduler.enqueue(Operation::connect(id, false));
        }
    }

    fn give_up(&mut self, id: &DeviceId) {
        let target = Target::from(id);
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        let failures = device.cycle().map(|c| c.failure_count()).unwrap_or(0);
        info!(device = %id, failures, "Giving up on connecting");

        device.cycle = None;
        device.ledger.compact();
        device.last_transaction_failure = None;
        let changed = device.update(Intent::Unintentional, None, |s| {
            s.remove_all(&CYCLE_FLAGS);
            s.remove(Connecting);
            if !s.contains(Connected) {
                s.insert(Disconnected);
            }
        });
        self.events.extend(changed);

        self.scheduler.clear_queue_of(OperationKind::Connect, &target);
        self.scheduler
            .clear_queue_matching(|op| op.target() == &target && op.kind().requires_connection());
    }

    fn cycle_fail_event(
        device: &Device,
        category: ConnectFailCategory,
        timing: Timing,
        now: Duration,
    ) -> ConnectFailEvent {
        let mut event = ConnectFailEvent::bare(device.id().clone(), category, timing);
        if let Some(cycle) = device.cycle() {
            event.failure_count = cycle.failure_count();
            event.attempt_time_total = cycle.total_elapsed(now);
            event.highest_state_reached = cycle.highest_attempt();
            event.highest_state_reached_total = cycle.highest_total();
        }
        event
    }
}
