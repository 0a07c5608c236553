//! Bounded per-device failure history

use gattmux_core::ConnectFailEvent;
use std::collections::VecDeque;

/// Chronological record of ConnectFail events for one device.
///
/// Holds at most `bound` entries (never fewer than one); the oldest entry is
/// evicted first. When a connect cycle completes the ledger is compacted to
/// its most recent entry, so the next cycle starts with the outcome of the
/// previous one and nothing older.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    events: VecDeque<ConnectFailEvent>,
    bound: usize,
}

impl FailureLedger {
    /// Create an empty ledger
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            events: VecDeque::with_capacity(bound),
            bound,
        }
    }

    /// Append an event, evicting the oldest ones past the bound
    pub fn push(&mut self, event: ConnectFailEvent) {
        self.events.push_back(event);
        while self.events.len() > self.bound {
            self.events.pop_front();
        }
    }

    /// Keep only the most recent entry
    pub fn compact(&mut self) {
        while self.events.len() > 1 {
            self.events.pop_front();
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// All entries, oldest first
    pub fn history(&self) -> Vec<ConnectFailEvent> {
        self.events.iter().cloned().collect()
    }

    /// Iterate entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ConnectFailEvent> {
        self.events.iter()
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&ConnectFailEvent> {
        self.events.back()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of entries
    pub fn bound(&self) -> usize {
        self.bound
    }
}
