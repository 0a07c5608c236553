//! Test doubles for the native transport
//!
//! `MockTransport` records every call it receives and can be told to reject
//! calls of a given kind synchronously. Replies are never generated here;
//! tests feed [`NativeEvent`](crate::NativeEvent)s back by hand so each step
//! of a scenario stays explicit.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{GattmuxError, Result};
use crate::id::{AttributeId, DeviceId, Target};
use crate::native::Transport;
use crate::operation::OperationKind;

/// A call the mock received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCall {
    /// What was called
    pub kind: OperationKind,
    /// Against what
    pub target: Target,
    /// Attribute, for characteristic and descriptor calls
    pub attribute: Option<AttributeId>,
    /// Written bytes, or `[enable]` for notify toggles
    pub data: Vec<u8>,
}

/// Recording transport
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    rejected: Arc<Mutex<HashSet<OperationKind>>>,
}

impl MockTransport {
    /// Create a new mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Make calls of this kind fail synchronously until [`accept`](Self::accept)
    pub fn reject(&self, kind: OperationKind) {
        self.rejected.lock().insert(kind);
    }

    /// Stop rejecting calls of this kind
    pub fn accept(&self, kind: OperationKind) {
        self.rejected.lock().remove(&kind);
    }

    /// Snapshot of all calls so far
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Kinds of all calls so far, in order
    pub fn call_kinds(&self) -> Vec<OperationKind> {
        self.calls.lock().iter().map(|c| c.kind).collect()
    }

    /// Number of calls of one kind
    pub fn count(&self, kind: OperationKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(
        &self,
        kind: OperationKind,
        target: Target,
        attribute: Option<AttributeId>,
        data: &[u8],
    ) -> Result<()> {
        self.calls.lock().push(TransportCall {
            kind,
            target,
            attribute,
            data: data.to_vec(),
        });

        if self.rejected.lock().contains(&kind) {
            return Err(GattmuxError::TransportRejected {
                operation: kind.to_string(),
                reason: "rejected by mock".into(),
            });
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::Connect, device.into(), None, &[])
    }

    fn disconnect(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::Disconnect, device.into(), None, &[])
    }

    fn discover_services(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::DiscoverServices, device.into(), None, &[])
    }

    fn bond(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::Bond, device.into(), None, &[])
    }

    fn unbond(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::Unbond, device.into(), None, &[])
    }

    fn read(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()> {
        self.record(OperationKind::Read, device.into(), Some(*attribute), &[])
    }

    fn write(&mut self, device: &DeviceId, attribute: &AttributeId, data: &[u8]) -> Result<()> {
        self.record(OperationKind::Write, device.into(), Some(*attribute), data)
    }

    fn read_descriptor(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()> {
        self.record(
            OperationKind::ReadDescriptor,
            device.into(),
            Some(*attribute),
            &[],
        )
    }

    fn write_descriptor(
        &mut self,
        device: &DeviceId,
        attribute: &AttributeId,
        data: &[u8],
    ) -> Result<()> {
        self.record(
            OperationKind::WriteDescriptor,
            device.into(),
            Some(*attribute),
            data,
        )
    }

    fn toggle_notify(
        &mut self,
        device: &DeviceId,
        attribute: &AttributeId,
        enable: bool,
    ) -> Result<()> {
        self.record(
            OperationKind::ToggleNotify,
            device.into(),
            Some(*attribute),
            &[enable as u8],
        )
    }

    fn read_rssi(&mut self, device: &DeviceId) -> Result<()> {
        self.record(OperationKind::ReadRssi, device.into(), None, &[])
    }

    fn turn_adapter_off(&mut self) -> Result<()> {
        self.record(OperationKind::TurnAdapterOff, Target::Adapter, None, &[])
    }

    fn name(&self) -> &str {
        "mock"
    }
}
