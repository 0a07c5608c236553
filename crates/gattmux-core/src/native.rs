//! The native transport contract
//!
//! The transport issues calls to the OS Bluetooth stack and never blocks:
//! `Ok(())` only means the call was accepted. The outcome arrives later as a
//! [`NativeEvent`], which the runtime marshals onto the update context and
//! matches back to the executing operation by kind and target.

use bytes::Bytes;

use crate::error::Result;
use crate::id::{AttributeId, DeviceId, Target};
use crate::operation::{OperationKind, OperationState};

/// GATT status for success
pub const GATT_SUCCESS: i32 = 0;

/// Link supervision timeout
pub const GATT_CONN_TIMEOUT: i32 = 8;

/// Stack-internal connection timeout reported by some chipsets
pub const GATT_CONN_FAIL_TIMEOUT: i32 = 147;

/// How a native status should end the operation that received it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOutcome {
    /// The call succeeded
    Success,
    /// The stack gave up waiting on the remote side
    Timeout,
    /// Any other failure
    Failure,
}

impl NativeOutcome {
    /// Classify a raw status code
    pub fn classify(status: i32) -> Self {
        match status {
            GATT_SUCCESS => NativeOutcome::Success,
            GATT_CONN_TIMEOUT | GATT_CONN_FAIL_TIMEOUT => NativeOutcome::Timeout,
            _ => NativeOutcome::Failure,
        }
    }

    /// Terminal operation state this outcome maps to
    pub fn terminal_state(&self) -> OperationState {
        match self {
            NativeOutcome::Success => OperationState::Succeeded,
            NativeOutcome::Timeout => OperationState::TimedOut,
            NativeOutcome::Failure => OperationState::Failed,
        }
    }
}

/// Bond state reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    /// Not bonded
    None,
    /// Pairing in progress
    Bonding,
    /// Bonded
    Bonded,
}

/// An inbound callback from the native stack
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    /// Reply to a call the transport issued
    Completed {
        /// What the call targeted
        target: Target,
        /// What the call did
        kind: OperationKind,
        /// Attribute, for characteristic and descriptor calls
        attribute: Option<AttributeId>,
        /// Native status code
        status: i32,
        /// Returned value (read data, RSSI, ...)
        payload: Bytes,
    },
    /// The link to a device went down
    ConnectionLost {
        /// Device that dropped
        device: DeviceId,
        /// Native status code
        status: i32,
    },
    /// Bond state changed
    BondStateChanged {
        /// Device whose bond changed
        device: DeviceId,
        /// New bond state
        state: BondState,
        /// Native status or bond failure reason
        status: i32,
    },
    /// A notification or indication arrived
    Notification {
        /// Sending device
        device: DeviceId,
        /// Characteristic that notified
        attribute: AttributeId,
        /// Value
        payload: Bytes,
    },
}

impl NativeEvent {
    /// Successful reply with no payload
    pub fn success(target: impl Into<Target>, kind: OperationKind) -> Self {
        NativeEvent::Completed {
            target: target.into(),
            kind,
            attribute: None,
            status: GATT_SUCCESS,
            payload: Bytes::new(),
        }
    }

    /// Failed reply with no payload
    pub fn failure(target: impl Into<Target>, kind: OperationKind, status: i32) -> Self {
        NativeEvent::Completed {
            target: target.into(),
            kind,
            attribute: None,
            status,
            payload: Bytes::new(),
        }
    }

    /// Device this event concerns, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            NativeEvent::Completed { target, .. } => target.device(),
            NativeEvent::ConnectionLost { device, .. }
            | NativeEvent::BondStateChanged { device, .. }
            | NativeEvent::Notification { device, .. } => Some(device),
        }
    }
}

/// Issues calls to the OS Bluetooth stack
pub trait Transport: Send {
    /// Open a link
    fn connect(&mut self, device: &DeviceId) -> Result<()>;

    /// Close a link
    fn disconnect(&mut self, device: &DeviceId) -> Result<()>;

    /// Start service discovery
    fn discover_services(&mut self, device: &DeviceId) -> Result<()>;

    /// Start bonding
    fn bond(&mut self, device: &DeviceId) -> Result<()>;

    /// Remove a bond
    fn unbond(&mut self, device: &DeviceId) -> Result<()>;

    /// Read a characteristic
    fn read(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()>;

    /// Write a characteristic
    fn write(&mut self, device: &DeviceId, attribute: &AttributeId, data: &[u8]) -> Result<()>;

    /// Read a descriptor
    fn read_descriptor(&mut self, device: &DeviceId, attribute: &AttributeId) -> Result<()>;

    /// Write a descriptor
    fn write_descriptor(
        &mut self,
        device: &DeviceId,
        attribute: &AttributeId,
        data: &[u8],
    ) -> Result<()>;

    /// Enable or disable notifications
    fn toggle_notify(&mut self, device: &DeviceId, attribute: &AttributeId, enable: bool)
        -> Result<()>;

    /// Read the remote RSSI
    fn read_rssi(&mut self, device: &DeviceId) -> Result<()>;

    /// Power the adapter down
    fn turn_adapter_off(&mut self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}
