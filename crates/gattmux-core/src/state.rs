//! Device connection state flags
//!
//! A device is described by a set of compatible flags rather than a single
//! enum value: a device can be `BONDED` and `CONNECTING` at once, or
//! `DISCONNECTED` while `RECONNECTING_SHORT_TERM`. `StateSet` is the bitset
//! that holds them and enforces the few exclusions that matter.

use serde::{Deserialize, Serialize};

/// One connection state flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// No link to the device
    Disconnected,
    /// Anywhere inside a connect cycle, retries included
    ConnectingOverall,
    /// A Connect operation is in flight
    Connecting,
    /// Link is up
    Connected,
    /// Service discovery is in flight
    DiscoveringServices,
    /// Caller-driven authentication phase
    Authenticating,
    /// Caller-driven initialization phase
    Initializing,
    /// Fully ready for reads and writes
    Initialized,
    /// Retrying shortly after a failure or drop
    ReconnectingShortTerm,
    /// Retrying slowly after short-term reconnect gave up
    ReconnectingLongTerm,
    /// A bond is being created
    Bonding,
    /// The device is bonded
    Bonded,
}

impl DeviceState {
    /// Every flag, in declaration order
    pub const ALL: [DeviceState; 12] = [
        DeviceState::Disconnected,
        DeviceState::ConnectingOverall,
        DeviceState::Connecting,
        DeviceState::Connected,
        DeviceState::DiscoveringServices,
        DeviceState::Authenticating,
        DeviceState::Initializing,
        DeviceState::Initialized,
        DeviceState::ReconnectingShortTerm,
        DeviceState::ReconnectingLongTerm,
        DeviceState::Bonding,
        DeviceState::Bonded,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Position along the connect path, for "highest state reached".
    ///
    /// Flags that are not steps on that path return `None`.
    pub fn connection_ordinal(&self) -> Option<u8> {
        match self {
            DeviceState::Disconnected => Some(0),
            DeviceState::Connecting => Some(1),
            DeviceState::Connected => Some(2),
            DeviceState::DiscoveringServices => Some(3),
            DeviceState::Authenticating => Some(4),
            DeviceState::Initializing => Some(5),
            DeviceState::Initialized => Some(6),
            _ => None,
        }
    }

    /// Flags cleared whenever the link goes down
    pub const LINK_FLAGS: [DeviceState; 6] = [
        DeviceState::Connecting,
        DeviceState::Connected,
        DeviceState::DiscoveringServices,
        DeviceState::Authenticating,
        DeviceState::Initializing,
        DeviceState::Initialized,
    ];
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::ConnectingOverall => "CONNECTING_OVERALL",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::Connected => "CONNECTED",
            DeviceState::DiscoveringServices => "DISCOVERING_SERVICES",
            DeviceState::Authenticating => "AUTHENTICATING",
            DeviceState::Initializing => "INITIALIZING",
            DeviceState::Initialized => "INITIALIZED",
            DeviceState::ReconnectingShortTerm => "RECONNECTING_SHORT_TERM",
            DeviceState::ReconnectingLongTerm => "RECONNECTING_LONG_TERM",
            DeviceState::Bonding => "BONDING",
            DeviceState::Bonded => "BONDED",
        };
        f.write_str(s)
    }
}

/// Set of device state flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<DeviceState>", into = "Vec<DeviceState>")]
pub struct StateSet(u16);

impl StateSet {
    /// The empty set
    pub fn empty() -> Self {
        Self(0)
    }

    /// A freshly discovered device
    pub fn disconnected() -> Self {
        Self(DeviceState::Disconnected.bit())
    }

    /// Check a single flag
    pub fn contains(&self, state: DeviceState) -> bool {
        self.0 & state.bit() != 0
    }

    /// Check whether any of the flags is set
    pub fn contains_any(&self, states: &[DeviceState]) -> bool {
        states.iter().any(|s| self.contains(*s))
    }

    /// Check whether all of the flags are set
    pub fn contains_all(&self, states: &[DeviceState]) -> bool {
        states.iter().all(|s| self.contains(*s))
    }

    /// Set a flag.
    ///
    /// `CONNECTED` and `DISCONNECTED` never coexist, so setting one clears
    /// the other.
    pub fn insert(&mut self, state: DeviceState) {
        match state {
            DeviceState::Connected => self.remove(DeviceState::Disconnected),
            DeviceState::Disconnected => self.remove(DeviceState::Connected),
            _ => {}
        }
        self.0 |= state.bit();
    }

    /// Clear a flag
    pub fn remove(&mut self, state: DeviceState) {
        self.0 &= !state.bit();
    }

    /// Clear several flags
    pub fn remove_all(&mut self, states: &[DeviceState]) {
        for state in states {
            self.remove(*state);
        }
    }

    /// Whether no flag is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the set flags in declaration order
    pub fn iter(&self) -> impl Iterator<Item = DeviceState> + '_ {
        DeviceState::ALL.into_iter().filter(|s| self.contains(*s))
    }

    /// Highest step on the connect path currently set
    pub fn highest_connection_state(&self) -> Option<DeviceState> {
        self.iter()
            .filter(|s| s.connection_ordinal().is_some())
            .max_by_key(|s| s.connection_ordinal())
    }
}

impl From<Vec<DeviceState>> for StateSet {
    fn from(states: Vec<DeviceState>) -> Self {
        let mut set = StateSet::empty();
        for state in states {
            set.insert(state);
        }
        set
    }
}

impl From<StateSet> for Vec<DeviceState> {
    fn from(set: StateSet) -> Self {
        set.iter().collect()
    }
}

impl FromIterator<DeviceState> for StateSet {
    fn from_iter<I: IntoIterator<Item = DeviceState>>(iter: I) -> Self {
        let mut set = StateSet::empty();
        for state in iter {
            set.insert(state);
        }
        set
    }
}

impl std::fmt::Debug for StateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl std::fmt::Display for StateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Whether a state change was asked for by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Triggered by an explicit API call
    Intentional,
    /// Triggered by the native stack or by the library itself
    Unintentional,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Intentional => write!(f, "intentional"),
            Intent::Unintentional => write!(f, "unintentional"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_excludes_disconnected() {
        let mut set = StateSet::disconnected();
        set.insert(DeviceState::Connected);
        assert!(set.contains(DeviceState::Connected));
        assert!(!set.contains(DeviceState::Disconnected));

        set.insert(DeviceState::Disconnected);
        assert!(!set.contains(DeviceState::Connected));
    }

    #[test]
    fn test_compatible_flags_coexist() {
        let set: StateSet = [
            DeviceState::Disconnected,
            DeviceState::ReconnectingShortTerm,
            DeviceState::Bonded,
        ]
        .into_iter()
        .collect();

        assert!(set.contains_all(&[DeviceState::Disconnected, DeviceState::Bonded]));
        assert!(set.contains_any(&[DeviceState::Connected, DeviceState::ReconnectingShortTerm]));
        assert!(!set.contains_any(&[DeviceState::Connected, DeviceState::Initialized]));
    }

    #[test]
    fn test_highest_connection_state() {
        let set: StateSet = [
            DeviceState::ConnectingOverall,
            DeviceState::Connected,
            DeviceState::DiscoveringServices,
            DeviceState::Bonded,
        ]
        .into_iter()
        .collect();
        assert_eq!(
            set.highest_connection_state(),
            Some(DeviceState::DiscoveringServices)
        );
        assert_eq!(StateSet::empty().highest_connection_state(), None);
    }

    #[test]
    fn test_state_set_serde() {
        let set: StateSet = [DeviceState::Connected, DeviceState::Bonded]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "[\"CONNECTED\",\"BONDED\"]");

        let back: StateSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_state_set_display() {
        let set: StateSet = [DeviceState::Disconnected].into_iter().collect();
        assert_eq!(set.to_string(), "[DISCONNECTED]");
    }
}
