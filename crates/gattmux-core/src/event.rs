//! Events delivered to callers

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::humantime_serde;
use crate::fail::ConnectFailEvent;
use crate::id::{AttributeId, DeviceId, Target};
use crate::operation::{OperationKind, OperationState};
use crate::state::{Intent, StateSet};

/// Which reconnect phase a device is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPhase {
    /// Right after a failure or drop, high frequency
    ShortTerm,
    /// After short-term gave up, low frequency
    LongTerm,
}

impl std::fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectPhase::ShortTerm => write!(f, "short_term"),
            ReconnectPhase::LongTerm => write!(f, "long_term"),
        }
    }
}

/// Events emitted by the device layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The device's state flags changed
    StateChanged {
        /// Device
        device: DeviceId,
        /// Flags before the change
        old: StateSet,
        /// Flags after the change
        new: StateSet,
        /// Who caused it
        intent: Intent,
        /// Native status attached to the change, if any
        native_status: Option<i32>,
    },

    /// A connection attempt failed
    ConnectFail(ConnectFailEvent),

    /// A retry was scheduled
    ReconnectScheduled {
        /// Device
        device: DeviceId,
        /// Phase the retry belongs to
        phase: ReconnectPhase,
        /// Delay before the attempt
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// An operation reached a terminal state
    OperationEnded {
        /// What it acted on
        target: Target,
        /// What it did
        kind: OperationKind,
        /// Attribute, for characteristic and descriptor operations
        attribute: Option<AttributeId>,
        /// How it ended
        state: OperationState,
        /// Native status, when the stack gave one
        native_status: Option<i32>,
    },

    /// A notification arrived
    Notification {
        /// Sending device
        device: DeviceId,
        /// Characteristic that notified
        attribute: AttributeId,
        /// Value
        payload: Vec<u8>,
    },
}

impl DeviceEvent {
    /// Device this event concerns, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            DeviceEvent::StateChanged { device, .. }
            | DeviceEvent::ReconnectScheduled { device, .. }
            | DeviceEvent::Notification { device, .. } => Some(device),
            DeviceEvent::ConnectFail(fail) => Some(&fail.device),
            DeviceEvent::OperationEnded { target, .. } => target.device(),
        }
    }
}
