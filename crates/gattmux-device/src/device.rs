//! Per-device connection state

use gattmux_core::{
    ConnectFailEvent, DeviceEvent, DeviceId, DeviceState, Intent, OperationFailure,
    ReconnectPhase, StateSet,
};
use serde::{Deserialize, Serialize};

use crate::cycle::{ConnectCycle, ConnectOptions};
use crate::ledger::FailureLedger;
use crate::policy::ReconnectPolicy;

/// One peripheral known to the manager
pub struct Device {
    id: DeviceId,
    state: StateSet,
    intent: Intent,
    pub(crate) ledger: FailureLedger,
    pub(crate) cycle: Option<ConnectCycle>,
    pub(crate) options: ConnectOptions,
    pub(crate) last_transaction_failure: Option<OperationFailure>,
    pub(crate) policy: Option<Box<dyn ReconnectPolicy>>,
}

impl Device {
    /// A device that has never connected
    pub fn new(id: DeviceId, history_bound: usize) -> Self {
        Self {
            id,
            state: StateSet::disconnected(),
            intent: Intent::Unintentional,
            ledger: FailureLedger::new(history_bound),
            cycle: None,
            options: ConnectOptions::default(),
            last_transaction_failure: None,
            policy: None,
        }
    }

    /// Address
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current flags
    pub fn state(&self) -> StateSet {
        self.state
    }

    /// Intent of the last transition
    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Check one flag
    pub fn is(&self, state: DeviceState) -> bool {
        self.state.contains(state)
    }

    /// Check whether any of the flags is set
    pub fn is_any(&self, states: &[DeviceState]) -> bool {
        self.state.contains_any(states)
    }

    /// ConnectFail history of the current cycle, oldest first
    pub fn history(&self) -> Vec<ConnectFailEvent> {
        self.ledger.history()
    }

    /// The running connect cycle, if any
    pub fn cycle(&self) -> Option<&ConnectCycle> {
        self.cycle.as_ref()
    }

    /// Options of the last connect
    pub fn options(&self) -> ConnectOptions {
        self.options
    }

    /// Apply a change to the flags. Returns the StateChanged event when the
    /// flags actually changed.
    pub(crate) fn update<F>(
        &mut self,
        intent: Intent,
        native_status: Option<i32>,
        change: F,
    ) -> Option<DeviceEvent>
    where
        F: FnOnce(&mut StateSet),
    {
        let old = self.state;
        let mut new = old;
        change(&mut new);
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.note_state(new.highest_connection_state());
        }
        if new == old {
            return None;
        }

        self.state = new;
        self.intent = intent;
        tracing::debug!(
            device = %self.id,
            old = %old,
            new = %new,
            intent = %intent,
            "Device state changed"
        );
        Some(DeviceEvent::StateChanged {
            device: self.id.clone(),
            old,
            new,
            intent,
            native_status,
        })
    }

    /// Serializable view for callers
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device: self.id.clone(),
            state: self.state,
            intent: self.intent,
            history_len: self.ledger.len(),
            failure_count: self.cycle.as_ref().map(|c| c.failure_count()).unwrap_or(0),
            reconnect_phase: self.cycle.as_ref().map(|c| c.phase()),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("intent", &self.intent)
            .field("history", &self.ledger.len())
            .field("cycle", &self.cycle)
            .finish()
    }
}

/// Point-in-time view of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Address
    pub device: DeviceId,
    /// Flags
    pub state: StateSet,
    /// Intent of the last transition
    pub intent: Intent,
    /// Entries in the failure history
    pub history_len: usize,
    /// Failures in the running cycle
    pub failure_count: u32,
    /// Phase of the running cycle
    pub reconnect_phase: Option<ReconnectPhase>,
}
