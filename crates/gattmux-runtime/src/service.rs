//! The gattmux service
//!
//! [`GattmuxService`] owns the [`DeviceManager`] and runs it on a single
//! task. Everything that mutates the scheduler or a device goes through
//! that task: caller requests arrive as [`GattmuxCommand`]s, native
//! callbacks arrive through the [`NativeEventReceiver`], and a timer drives
//! the scheduler tick. Device events are broadcast after every step and a
//! snapshot of all devices is published for reads that should not wait on
//! the task.

use bytes::Bytes;
use gattmux_core::{
    AttributeId, ConnectFailEvent, DeviceEvent, DeviceId, DeviceState, GattmuxConfig,
    OperationState, Result as CoreResult, StateSet, Transport,
};
use gattmux_device::{
    ConnectOptions, DeviceManager, DeviceSnapshot, ReconnectDecision, ReconnectEvent,
    ReconnectPolicy, TransactionPhase,
};
use gattmux_scheduler::{Completion, OpId, Operation};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::error::{Result, RuntimeError};
use crate::pacer::Pacer;
use crate::sink::NativeEventReceiver;

/// Capacity of the device event broadcast
const EVENT_CAPACITY: usize = 1024;

/// Capacity of the command queue
const COMMAND_CAPACITY: usize = 256;

/// A reconnect policy shipped to the update context
pub struct BoxedPolicy(Box<dyn ReconnectPolicy>);

impl std::fmt::Debug for BoxedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxedPolicy(..)")
    }
}

impl ReconnectPolicy for BoxedPolicy {
    fn decide(&self, event: &ReconnectEvent) -> ReconnectDecision {
        self.0.decide(event)
    }
}

/// Commands that can be sent to the service
#[derive(Debug)]
pub enum GattmuxCommand {
    /// Register a device
    AddDevice {
        device: DeviceId,
        response: oneshot::Sender<()>,
    },
    /// Start a connect cycle
    Connect {
        device: DeviceId,
        options: ConnectOptions,
        response: oneshot::Sender<Option<OpId>>,
    },
    /// Disconnect on purpose
    Disconnect {
        device: DeviceId,
        response: oneshot::Sender<CoreResult<OpId>>,
    },
    /// Bond explicitly
    Bond {
        device: DeviceId,
        response: oneshot::Sender<CoreResult<OpId>>,
    },
    /// Remove a bond
    Unbond {
        device: DeviceId,
        response: oneshot::Sender<CoreResult<OpId>>,
    },
    /// Finish an authentication or initialization phase
    CompleteTransaction {
        device: DeviceId,
        phase: TransactionPhase,
        succeeded: bool,
        response: oneshot::Sender<CoreResult<()>>,
    },
    /// The adapter is being turned off
    AdapterTurningOff,
    /// Enqueue an operation
    Submit {
        operation: Operation,
        response: oneshot::Sender<CoreResult<OpId>>,
    },
    /// Replace the reconnect policy for every device without an override
    SetPolicy { policy: BoxedPolicy },
    /// Give one device its own reconnect policy
    SetDevicePolicy {
        device: DeviceId,
        policy: BoxedPolicy,
        response: oneshot::Sender<CoreResult<()>>,
    },
    /// Read a device's failure history
    History {
        device: DeviceId,
        response: oneshot::Sender<Vec<ConnectFailEvent>>,
    },
    /// Read a device's state flags
    State {
        device: DeviceId,
        response: oneshot::Sender<Option<StateSet>>,
    },
    /// Stop the service
    Shutdown,
}

/// How an awaited operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Ordinal of the operation
    pub id: OpId,
    /// Terminal state
    pub state: OperationState,
    /// Native status, when the stack gave one
    pub native_status: Option<i32>,
    /// Returned value (read data, RSSI, ...)
    pub payload: Bytes,
}

impl OperationResult {
    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        self.state == OperationState::Succeeded
    }
}

impl From<&Completion> for OperationResult {
    fn from(completion: &Completion) -> Self {
        Self {
            id: completion.id,
            state: completion.state,
            native_status: completion.native_status,
            payload: completion.payload.clone(),
        }
    }
}

/// Handle for interacting with the service
#[derive(Clone)]
pub struct GattmuxHandle {
    command_tx: mpsc::Sender<GattmuxCommand>,
    event_tx: broadcast::Sender<DeviceEvent>,
    snapshot: Arc<RwLock<Vec<DeviceSnapshot>>>,
}

impl GattmuxHandle {
    async fn send(&self, command: GattmuxCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RuntimeError::Channel("Failed to send command".into()))
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> GattmuxCommand,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await
            .map_err(|_| RuntimeError::Channel("Failed to receive response".into()))
    }

    /// Register a device
    pub async fn add_device(&self, device: &DeviceId) -> Result<()> {
        let device = device.clone();
        self.request(|response| GattmuxCommand::AddDevice { device, response })
            .await
    }

    /// Start a connect cycle with no transaction phases.
    ///
    /// Returns `None` when the device was already connecting or connected.
    pub async fn connect(&self, device: &DeviceId) -> Result<Option<OpId>> {
        self.connect_with(device, ConnectOptions::default()).await
    }

    /// Start a connect cycle with the given transaction phases
    pub async fn connect_with(
        &self,
        device: &DeviceId,
        options: ConnectOptions,
    ) -> Result<Option<OpId>> {
        let device = device.clone();
        self.request(|response| GattmuxCommand::Connect {
            device,
            options,
            response,
        })
        .await
    }

    /// Disconnect on purpose
    pub async fn disconnect(&self, device: &DeviceId) -> Result<OpId> {
        let device = device.clone();
        Ok(self
            .request(|response| GattmuxCommand::Disconnect { device, response })
            .await??)
    }

    /// Bond explicitly
    pub async fn bond(&self, device: &DeviceId) -> Result<OpId> {
        let device = device.clone();
        Ok(self
            .request(|response| GattmuxCommand::Bond { device, response })
            .await??)
    }

    /// Remove a bond
    pub async fn unbond(&self, device: &DeviceId) -> Result<OpId> {
        let device = device.clone();
        Ok(self
            .request(|response| GattmuxCommand::Unbond { device, response })
            .await??)
    }

    /// Finish an authentication or initialization phase
    pub async fn complete_transaction(
        &self,
        device: &DeviceId,
        phase: TransactionPhase,
        succeeded: bool,
    ) -> Result<()> {
        let device = device.clone();
        Ok(self
            .request(|response| GattmuxCommand::CompleteTransaction {
                device,
                phase,
                succeeded,
                response,
            })
            .await??)
    }

    /// Tell the core the adapter is being turned off
    pub async fn adapter_turning_off(&self) -> Result<()> {
        self.send(GattmuxCommand::AdapterTurningOff).await
    }

    /// Enqueue an operation without waiting for it to end
    pub async fn submit(&self, operation: Operation) -> Result<OpId> {
        Ok(self
            .request(|response| GattmuxCommand::Submit {
                operation,
                response,
            })
            .await??)
    }

    /// Enqueue an operation and wait for its terminal state.
    ///
    /// Replaces any completion callback already attached. An operation
    /// interrupted by a bond resolves once its resumed run has ended.
    pub async fn execute(&self, operation: Operation) -> Result<OperationResult> {
        let (done_tx, done_rx) = oneshot::channel();
        let operation = operation.on_complete(move |completion| {
            let _ = done_tx.send(OperationResult::from(completion));
        });
        let id = self.submit(operation).await?;
        done_rx
            .await
            .map_err(|_| RuntimeError::CompletionLost(id.to_string()))
    }

    /// Read a characteristic
    pub async fn read(&self, device: &DeviceId, attribute: AttributeId) -> Result<OperationResult> {
        self.execute(Operation::read(device, attribute)).await
    }

    /// Write a characteristic
    pub async fn write(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
        data: impl Into<Bytes>,
    ) -> Result<OperationResult> {
        self.execute(Operation::write(device, attribute, data)).await
    }

    /// Read a descriptor
    pub async fn read_descriptor(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
    ) -> Result<OperationResult> {
        self.execute(Operation::read_descriptor(device, attribute))
            .await
    }

    /// Write a descriptor
    pub async fn write_descriptor(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
        data: impl Into<Bytes>,
    ) -> Result<OperationResult> {
        self.execute(Operation::write_descriptor(device, attribute, data))
            .await
    }

    /// Enable or disable notifications
    pub async fn toggle_notify(
        &self,
        device: &DeviceId,
        attribute: AttributeId,
        enable: bool,
    ) -> Result<OperationResult> {
        self.execute(Operation::toggle_notify(device, attribute, enable))
            .await
    }

    /// Read the remote RSSI
    pub async fn read_rssi(&self, device: &DeviceId) -> Result<OperationResult> {
        self.execute(Operation::read_rssi(device)).await
    }

    /// Replace the reconnect policy for every device without an override
    pub async fn set_policy(&self, policy: impl ReconnectPolicy + 'static) -> Result<()> {
        self.send(GattmuxCommand::SetPolicy {
            policy: BoxedPolicy(Box::new(policy)),
        })
        .await
    }

    /// Give one device its own reconnect policy
    pub async fn set_device_policy(
        &self,
        device: &DeviceId,
        policy: impl ReconnectPolicy + 'static,
    ) -> Result<()> {
        let device = device.clone();
        let policy = BoxedPolicy(Box::new(policy));
        Ok(self
            .request(|response| GattmuxCommand::SetDevicePolicy {
                device,
                policy,
                response,
            })
            .await??)
    }

    /// Failure history of a device, oldest first
    pub async fn history(&self, device: &DeviceId) -> Result<Vec<ConnectFailEvent>> {
        let device = device.clone();
        self.request(|response| GattmuxCommand::History { device, response })
            .await
    }

    /// State flags of a device, `None` if unknown
    pub async fn state(&self, device: &DeviceId) -> Result<Option<StateSet>> {
        let device = device.clone();
        self.request(|response| GattmuxCommand::State { device, response })
            .await
    }

    /// Whether a device currently has a state flag
    pub async fn is(&self, device: &DeviceId, state: DeviceState) -> Result<bool> {
        Ok(self
            .state(device)
            .await?
            .is_some_and(|flags| flags.contains(state)))
    }

    /// Whether a device currently has any of the flags
    pub async fn is_any(&self, device: &DeviceId, states: &[DeviceState]) -> Result<bool> {
        Ok(self
            .state(device)
            .await?
            .is_some_and(|flags| flags.contains_any(states)))
    }

    /// Last published snapshot of every device, ordered by address
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.snapshot.read().clone()
    }

    /// Subscribe to device events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the service
    pub async fn shutdown(&self) -> Result<()> {
        self.send(GattmuxCommand::Shutdown).await
    }
}

/// Hosts the update context
pub struct GattmuxService<T: Transport> {
    manager: DeviceManager<T>,
    pacer: Pacer,
    event_tx: broadcast::Sender<DeviceEvent>,
    command_rx: mpsc::Receiver<GattmuxCommand>,
    command_tx: mpsc::Sender<GattmuxCommand>,
    native_rx: NativeEventReceiver,
    snapshot: Arc<RwLock<Vec<DeviceSnapshot>>>,
}

impl<T: Transport> GattmuxService<T> {
    /// Create the service.
    ///
    /// `native` is the receiving end of the sink handed to `transport`.
    pub fn new(
        config: GattmuxConfig,
        transport: T,
        native: NativeEventReceiver,
    ) -> Result<(Self, GattmuxHandle, broadcast::Receiver<DeviceEvent>)> {
        let pacer = Pacer::new(&config.scheduler);
        let manager = DeviceManager::new(config, transport)?;
        let (event_tx, event_rx) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let service = Self {
            manager,
            pacer,
            event_tx,
            command_rx,
            command_tx,
            native_rx: native,
            snapshot: Arc::new(RwLock::new(Vec::new())),
        };
        let handle = service.handle();
        Ok((service, handle, event_rx))
    }

    /// Another handle to this service
    pub fn handle(&self) -> GattmuxHandle {
        GattmuxHandle {
            command_tx: self.command_tx.clone(),
            event_tx: self.event_tx.clone(),
            snapshot: self.snapshot.clone(),
        }
    }

    /// Replace the reconnect policy before the service starts
    pub fn set_policy(&mut self, policy: impl ReconnectPolicy + 'static) {
        self.manager.set_policy(policy);
    }

    /// The device manager
    pub fn manager(&self) -> &DeviceManager<T> {
        &self.manager
    }

    /// Run until shut down
    pub async fn run(mut self) -> Result<()> {
        info!(
            transport = self.manager.transport().name(),
            rate = ?self.pacer.rate(),
            "Starting gattmux service"
        );

        let mut ticker = interval_for(self.pacer.rate());
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                    self.wake(&mut ticker);
                }

                Some(event) = self.native_rx.recv() => {
                    self.manager.on_native_event(event);
                    self.wake(&mut ticker);
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    trace!(?dt, "Tick");
                    self.manager.tick(dt);
                    if let Some(rate) = self.pacer.after_tick(dt, !self.manager.is_idle()) {
                        debug!(?rate, "Idle, slowing ticks");
                        ticker = interval_for(rate);
                    }
                }
            }

            self.publish();
        }

        info!("Gattmux service stopped");
        Ok(())
    }

    fn wake(&mut self, ticker: &mut Interval) {
        if let Some(rate) = self.pacer.wake() {
            debug!(?rate, "Work arrived, resuming ticks");
            *ticker = interval_for(rate);
        }
    }

    fn publish(&mut self) {
        for event in self.manager.drain_events() {
            trace!(?event, "Device event");
            // no subscribers is fine
            let _ = self.event_tx.send(event);
        }
        *self.snapshot.write() = self.manager.snapshot();
    }

    /// Handle a command, returns false if should shutdown
    fn handle_command(&mut self, cmd: GattmuxCommand) -> bool {
        match cmd {
            GattmuxCommand::AddDevice { device, response } => {
                self.manager.add_device(device);
                let _ = response.send(());
            }

            GattmuxCommand::Connect {
                device,
                options,
                response,
            } => {
                let _ = response.send(self.manager.connect_with(&device, options));
            }

            GattmuxCommand::Disconnect { device, response } => {
                let _ = response.send(self.manager.disconnect(&device));
            }

            GattmuxCommand::Bond { device, response } => {
                let _ = response.send(self.manager.bond(&device));
            }

            GattmuxCommand::Unbond { device, response } => {
                let _ = response.send(self.manager.unbond(&device));
            }

            GattmuxCommand::CompleteTransaction {
                device,
                phase,
                succeeded,
                response,
            } => {
                let _ = response.send(
                    self.manager
                        .complete_transaction(&device, phase, succeeded),
                );
            }

            GattmuxCommand::AdapterTurningOff => {
                self.manager.adapter_turning_off();
            }

            GattmuxCommand::Submit {
                operation,
                response,
            } => {
                let _ = response.send(self.manager.submit(operation));
            }

            GattmuxCommand::SetPolicy { policy } => {
                debug!("Reconnect policy replaced");
                self.manager.set_policy(policy);
            }

            GattmuxCommand::SetDevicePolicy {
                device,
                policy,
                response,
            } => {
                let _ = response.send(self.manager.set_device_policy(&device, policy));
            }

            GattmuxCommand::History { device, response } => {
                let _ = response.send(self.manager.history(&device));
            }

            GattmuxCommand::State { device, response } => {
                let _ = response.send(self.manager.state(&device));
            }

            GattmuxCommand::Shutdown => {
                info!("Shutting down gattmux service");
                return false;
            }
        }
        true
    }
}

fn interval_for(rate: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + rate, rate);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
