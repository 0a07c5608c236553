//! Schedulable operations
//!
//! An [`Operation`] is one pending or in-flight hardware action. It is built
//! by the device layer, handed to the [`Scheduler`](crate::Scheduler), and
//! ends in exactly one terminal state, at which point its completion callback
//! fires once and the value is dropped.

use bytes::Bytes;
use gattmux_core::{AttributeId, DeviceId, OperationKind, OperationState, Priority, Target};
use std::time::Duration;

/// Identity of a queued or executing operation (its ordinal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an operation's owner learns when it ends
#[derive(Debug, Clone)]
pub struct Completion {
    /// Ordinal of the ended operation
    pub id: OpId,
    /// What it did
    pub kind: OperationKind,
    /// What it acted on
    pub target: Target,
    /// Attribute, for characteristic and descriptor operations
    pub attribute: Option<AttributeId>,
    /// Terminal state
    pub state: OperationState,
    /// Native status, when the stack gave one
    pub native_status: Option<i32>,
    /// Returned value (read data, RSSI, ...)
    pub payload: Bytes,
    /// Time spent executing
    pub elapsed: Duration,
    /// Whether the caller asked for it
    pub explicit: bool,
    /// Whether it ran inside an authentication or initialization phase
    pub transactional: bool,
}

impl Completion {
    /// Device the operation targeted, if any
    pub fn device(&self) -> Option<&DeviceId> {
        self.target.device()
    }
}

/// Callback fired once when an operation reaches a terminal state
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

/// One schedulable hardware action
pub struct Operation {
    kind: OperationKind,
    target: Target,
    attribute: Option<AttributeId>,
    priority: Priority,
    ordinal: Option<u64>,
    state: OperationState,
    explicit: bool,
    cancellable_by_connect: bool,
    transactional: bool,
    soft_cancelled: bool,
    elapsed: Duration,
    payload: Bytes,
    enable: bool,
    on_complete: Option<CompletionCallback>,
}

impl Operation {
    /// Create an implicit operation with the default priority for its kind
    pub fn new(kind: OperationKind, target: Target) -> Self {
        let priority = match kind {
            OperationKind::Connect
            | OperationKind::Disconnect
            | OperationKind::Bond
            | OperationKind::Unbond => Priority::ForImplicitBondingAndConnecting,
            OperationKind::DiscoverServices => Priority::Medium,
            OperationKind::TurnAdapterOff => Priority::Critical,
            _ => Priority::NORMAL,
        };

        Self {
            kind,
            target,
            attribute: None,
            priority,
            ordinal: None,
            state: OperationState::Created,
            explicit: false,
            cancellable_by_connect: false,
            transactional: false,
            soft_cancelled: false,
            elapsed: Duration::ZERO,
            payload: Bytes::new(),
            enable: true,
            on_complete: None,
        }
    }

    /// Connect; explicit connects outrank the ones issued by the retry loop
    pub fn connect(device: &DeviceId, explicit: bool) -> Self {
        Self::new(OperationKind::Connect, device.into()).explicit(explicit)
    }

    /// Disconnect; an explicit one can be cancelled by a later connect
    pub fn disconnect(device: &DeviceId, explicit: bool) -> Self {
        Self::new(OperationKind::Disconnect, device.into())
            .explicit(explicit)
            .cancellable_by_connect(explicit)
    }

    /// Service discovery
    pub fn discover_services(device: &DeviceId) -> Self {
        Self::new(OperationKind::DiscoverServices, device.into())
    }

    /// Bond
    pub fn bond(device: &DeviceId, explicit: bool) -> Self {
        Self::new(OperationKind::Bond, device.into()).explicit(explicit)
    }

    /// Unbond
    pub fn unbond(device: &DeviceId) -> Self {
        Self::new(OperationKind::Unbond, device.into()).explicit(true)
    }

    /// Characteristic read
    pub fn read(device: &DeviceId, attribute: AttributeId) -> Self {
        Self::new(OperationKind::Read, device.into())
            .explicit(true)
            .with_attribute(attribute)
    }

    /// Characteristic write
    pub fn write(device: &DeviceId, attribute: AttributeId, data: impl Into<Bytes>) -> Self {
        Self::new(OperationKind::Write, device.into())
            .explicit(true)
            .with_attribute(attribute)
            .with_payload(data)
    }

    /// Descriptor read
    pub fn read_descriptor(device: &DeviceId, attribute: AttributeId) -> Self {
        Self::new(OperationKind::ReadDescriptor, device.into())
            .explicit(true)
            .with_attribute(attribute)
    }

    /// Descriptor write
    pub fn write_descriptor(
        device: &DeviceId,
        attribute: AttributeId,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(OperationKind::WriteDescriptor, device.into())
            .explicit(true)
            .with_attribute(attribute)
            .with_payload(data)
    }

    /// Enable or disable notifications
    pub fn toggle_notify(device: &DeviceId, attribute: AttributeId, enable: bool) -> Self {
        let mut op = Self::new(OperationKind::ToggleNotify, device.into())
            .explicit(true)
            .with_attribute(attribute);
        op.enable = enable;
        op
    }

    /// RSSI read
    pub fn read_rssi(device: &DeviceId) -> Self {
        Self::new(OperationKind::ReadRssi, device.into()).explicit(true)
    }

    /// Adapter power-down
    pub fn turn_adapter_off() -> Self {
        Self::new(OperationKind::TurnAdapterOff, Target::Adapter).explicit(true)
    }

    /// Mark as caller-initiated. Explicit link and bond operations move up
    /// one priority class.
    pub fn explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        if matches!(
            self.kind,
            OperationKind::Connect
                | OperationKind::Disconnect
                | OperationKind::Bond
                | OperationKind::Unbond
        ) && self.priority == Priority::ForImplicitBondingAndConnecting
            && explicit
        {
            self.priority = Priority::ForExplicitBondingAndConnecting;
        }
        self
    }

    /// Let a later Connect to the same device cancel this Disconnect
    pub fn cancellable_by_connect(mut self, cancellable: bool) -> Self {
        self.cancellable_by_connect = cancellable;
        self
    }

    /// Mark as part of an authentication or initialization phase
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        if transactional && self.priority < Priority::ForPriorityReadsWrites {
            self.priority = Priority::ForPriorityReadsWrites;
        }
        self
    }

    /// Override the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attribute
    pub fn with_attribute(mut self, attribute: AttributeId) -> Self {
        self.attribute = Some(attribute);
        self
    }

    /// Set the bytes to write
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Attach a completion callback
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Kind
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Target
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Target device, if the target is a device
    pub fn device(&self) -> Option<&DeviceId> {
        self.target.device()
    }

    /// Attribute, if any
    pub fn attribute(&self) -> Option<&AttributeId> {
        self.attribute.as_ref()
    }

    /// Priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Ordinal, once the scheduler has assigned one
    pub fn id(&self) -> Option<OpId> {
        self.ordinal.map(OpId)
    }

    /// Lifecycle state
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Whether the caller asked for it
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Whether a later Connect may cancel it
    pub fn is_cancellable_by_connect(&self) -> bool {
        self.cancellable_by_connect
    }

    /// Whether it runs inside a transaction phase
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Whether a later operation has made it redundant
    pub fn is_softly_cancelled(&self) -> bool {
        self.soft_cancelled
    }

    /// Time spent executing so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Bytes to write
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Requested notification state, for ToggleNotify
    pub fn enable(&self) -> bool {
        self.enable
    }

    /// Same kind and target
    pub fn matches(&self, kind: OperationKind, target: &Target) -> bool {
        self.kind == kind && &self.target == target
    }

    // ----- scheduler-side mutation -----

    /// Assign the ordinal unless one is already set. Returns the ordinal.
    pub(crate) fn assign_ordinal(&mut self, counter: &mut u64) -> u64 {
        match self.ordinal {
            Some(ordinal) => ordinal,
            None => {
                let ordinal = *counter;
                *counter += 1;
                self.ordinal = Some(ordinal);
                ordinal
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: OperationState) {
        self.state = state;
    }

    pub(crate) fn mark_soft_cancelled(&mut self) {
        self.soft_cancelled = true;
    }

    pub(crate) fn advance(&mut self, dt: Duration) {
        self.elapsed += dt;
    }

    pub(crate) fn take_callback(&mut self) -> Option<CompletionCallback> {
        self.on_complete.take()
    }

    /// Fresh copy of an interrupted operation that runs again once the
    /// interrupter is done. Keeps the ordinal and takes over the callback, so
    /// the caller hears the outcome of the resumed run.
    pub(crate) fn resumption(&mut self) -> Operation {
        Operation {
            kind: self.kind,
            target: self.target.clone(),
            attribute: self.attribute,
            priority: self.priority,
            ordinal: self.ordinal,
            state: OperationState::Queued,
            explicit: self.explicit,
            cancellable_by_connect: self.cancellable_by_connect,
            transactional: self.transactional,
            soft_cancelled: false,
            elapsed: Duration::ZERO,
            payload: self.payload.clone(),
            enable: self.enable,
            on_complete: self.on_complete.take(),
        }
    }

    pub(crate) fn completion(
        &self,
        native_status: Option<i32>,
        payload: Bytes,
    ) -> Completion {
        Completion {
            id: OpId(self.ordinal.unwrap_or_default()),
            kind: self.kind,
            target: self.target.clone(),
            attribute: self.attribute,
            state: self.state,
            native_status,
            payload,
            elapsed: self.elapsed,
            explicit: self.explicit,
            transactional: self.transactional,
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("attribute", &self.attribute)
            .field("priority", &self.priority)
            .field("ordinal", &self.ordinal)
            .field("state", &self.state)
            .field("explicit", &self.explicit)
            .field("soft_cancelled", &self.soft_cancelled)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ordinal {
            Some(ordinal) => write!(f, "{}({})#{}", self.kind, self.target, ordinal),
            None => write!(f, "{}({})", self.kind, self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::parse("00:11:22:33:44:55").unwrap()
    }

    #[test]
    fn test_default_priorities() {
        let d = device();
        assert_eq!(
            Operation::connect(&d, true).priority(),
            Priority::ForExplicitBondingAndConnecting
        );
        assert_eq!(
            Operation::connect(&d, false).priority(),
            Priority::ForImplicitBondingAndConnecting
        );
        assert_eq!(
            Operation::disconnect(&d, true).priority(),
            Priority::ForExplicitBondingAndConnecting
        );
        assert_eq!(
            Operation::discover_services(&d).priority(),
            Priority::Medium
        );
        assert_eq!(Operation::turn_adapter_off().priority(), Priority::Critical);
        assert_eq!(
            Operation::read_rssi(&d).priority(),
            Priority::ForNormalReadsWrites
        );
    }

    #[test]
    fn test_transactional_bumps_priority() {
        let attr = AttributeId::characteristic(uuid::Uuid::nil(), uuid::Uuid::nil());
        let op = Operation::read(&device(), attr).transactional(true);
        assert_eq!(op.priority(), Priority::ForPriorityReadsWrites);
        assert!(op.is_transactional());
    }

    #[test]
    fn test_ordinal_assigned_once() {
        let mut counter = 7;
        let mut op = Operation::read_rssi(&device());

        assert_eq!(op.assign_ordinal(&mut counter), 7);
        assert_eq!(op.assign_ordinal(&mut counter), 7);
        assert_eq!(counter, 8);
        assert_eq!(op.id(), Some(OpId(7)));
    }

    #[test]
    fn test_explicit_disconnect_is_cancellable_by_connect() {
        assert!(Operation::disconnect(&device(), true).is_cancellable_by_connect());
        assert!(!Operation::disconnect(&device(), false).is_cancellable_by_connect());
    }

    #[test]
    fn test_resumption_keeps_identity_drops_callback() {
        let mut counter = 0;
        let mut op = Operation::read_rssi(&device()).on_complete(|_| {});
        op.assign_ordinal(&mut counter);
        op.advance(Duration::from_millis(40));

        let mut again = op.resumption();
        assert_eq!(again.id(), op.id());
        assert_eq!(again.elapsed(), Duration::ZERO);
        assert_eq!(again.state(), OperationState::Queued);
        assert!(again.take_callback().is_none());
        assert!(op.take_callback().is_some());
    }

    #[test]
    fn test_display() {
        let mut counter = 3;
        let mut op = Operation::connect(&device(), true);
        assert_eq!(op.to_string(), "connect(00:11:22:33:44:55)");
        op.assign_ordinal(&mut counter);
        assert_eq!(op.to_string(), "connect(00:11:22:33:44:55)#3");
    }
}
