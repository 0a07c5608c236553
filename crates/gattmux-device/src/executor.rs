//! Bridge from the scheduler to the transport

use gattmux_core::{DeviceId, DeviceState, OperationKind, Result, Transport};
use gattmux_scheduler::{Execution, Executor, Operation};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::device::Device;

/// Checks preconditions against device state and issues transport calls.
///
/// Built fresh for every scheduler pass so it can borrow the device arena
/// and the transport side by side.
pub(crate) struct DeviceExecutor<'a, T: Transport> {
    devices: &'a HashMap<DeviceId, Device>,
    transport: &'a mut T,
}

impl<'a, T: Transport> DeviceExecutor<'a, T> {
    pub(crate) fn new(devices: &'a HashMap<DeviceId, Device>, transport: &'a mut T) -> Self {
        Self { devices, transport }
    }

    fn issued(op: &Operation, result: Result<()>) -> Execution {
        match result {
            Ok(()) => Execution::Started,
            Err(e) => {
                warn!(
                    op = %op,
                    error = %e,
                    code = e.error_code(),
                    "Transport refused the call"
                );
                Execution::FailedImmediately(None)
            }
        }
    }
}

impl<'a, T: Transport> Executor for DeviceExecutor<'a, T> {
    fn is_armable(&self, op: &Operation) -> bool {
        let Some(id) = op.device() else {
            return true;
        };
        let Some(device) = self.devices.get(id) else {
            return false;
        };

        match op.kind() {
            OperationKind::Connect
            | OperationKind::Disconnect
            | OperationKind::Bond
            | OperationKind::Unbond
            | OperationKind::TurnAdapterOff => true,
            OperationKind::DiscoverServices | OperationKind::ReadRssi => {
                device.is(DeviceState::Connected)
            }
            kind if kind.is_attribute_op() => {
                if op.is_transactional() {
                    device.is(DeviceState::Connected)
                } else {
                    device.is(DeviceState::Initialized)
                }
            }
            _ => false,
        }
    }

    fn execute(&mut self, op: &Operation) -> Execution {
        let Some(id) = op.device() else {
            return match op.kind() {
                OperationKind::TurnAdapterOff => {
                    let result = self.transport.turn_adapter_off();
                    Self::issued(op, result)
                }
                _ => Execution::FailedImmediately(None),
            };
        };
        let device = self.devices.get(id);
        let is = |state| device.is_some_and(|d| d.is(state));

        let result = match op.kind() {
            OperationKind::Connect => {
                if is(DeviceState::Connected) {
                    debug!(device = %id, "Already connected");
                    return Execution::Redundant;
                }
                self.transport.connect(id)
            }
            OperationKind::Disconnect => self.transport.disconnect(id),
            OperationKind::DiscoverServices => self.transport.discover_services(id),
            OperationKind::Bond => {
                if is(DeviceState::Bonded) {
                    return Execution::Redundant;
                }
                self.transport.bond(id)
            }
            OperationKind::Unbond => {
                if !is(DeviceState::Bonded) && !is(DeviceState::Bonding) {
                    return Execution::Redundant;
                }
                self.transport.unbond(id)
            }
            OperationKind::ReadRssi => self.transport.read_rssi(id),
            OperationKind::TurnAdapterOff => self.transport.turn_adapter_off(),
            kind => {
                let Some(attribute) = op.attribute() else {
                    warn!(op = %op, "Attribute operation without an attribute");
                    return Execution::FailedImmediately(None);
                };
                match kind {
                    OperationKind::Read => self.transport.read(id, attribute),
                    OperationKind::Write => self.transport.write(id, attribute, op.payload()),
                    OperationKind::ReadDescriptor => self.transport.read_descriptor(id, attribute),
                    OperationKind::WriteDescriptor => {
                        self.transport.write_descriptor(id, attribute, op.payload())
                    }
                    OperationKind::ToggleNotify => {
                        self.transport.toggle_notify(id, attribute, op.enable())
                    }
                    _ => return Execution::FailedImmediately(None),
                }
            }
        };
        Self::issued(op, result)
    }
}
