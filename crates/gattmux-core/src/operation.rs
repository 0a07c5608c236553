//! Operation vocabulary: kinds, priorities and lifecycle states

use serde::{Deserialize, Serialize};

/// The hardware action an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Open a GATT connection
    Connect,
    /// Close a GATT connection
    Disconnect,
    /// Enumerate remote services
    DiscoverServices,
    /// Create a bond
    Bond,
    /// Remove a bond
    Unbond,
    /// Read a characteristic
    Read,
    /// Write a characteristic
    Write,
    /// Read a descriptor
    ReadDescriptor,
    /// Write a descriptor
    WriteDescriptor,
    /// Enable or disable notifications
    ToggleNotify,
    /// Read the remote signal strength
    ReadRssi,
    /// Power the local adapter down
    TurnAdapterOff,
}

impl OperationKind {
    /// Every kind, in declaration order
    pub const ALL: [OperationKind; 12] = [
        OperationKind::Connect,
        OperationKind::Disconnect,
        OperationKind::DiscoverServices,
        OperationKind::Bond,
        OperationKind::Unbond,
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::ReadDescriptor,
        OperationKind::WriteDescriptor,
        OperationKind::ToggleNotify,
        OperationKind::ReadRssi,
        OperationKind::TurnAdapterOff,
    ];

    /// Kinds that can only run against a connected device
    pub fn requires_connection(&self) -> bool {
        matches!(
            self,
            OperationKind::DiscoverServices
                | OperationKind::Read
                | OperationKind::Write
                | OperationKind::ReadDescriptor
                | OperationKind::WriteDescriptor
                | OperationKind::ToggleNotify
                | OperationKind::ReadRssi
        )
    }

    /// Kinds addressed to a characteristic or descriptor
    pub fn is_attribute_op(&self) -> bool {
        matches!(
            self,
            OperationKind::Read
                | OperationKind::Write
                | OperationKind::ReadDescriptor
                | OperationKind::WriteDescriptor
                | OperationKind::ToggleNotify
        )
    }

    /// Stable lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::DiscoverServices => "discover_services",
            OperationKind::Bond => "bond",
            OperationKind::Unbond => "unbond",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::ReadDescriptor => "read_descriptor",
            OperationKind::WriteDescriptor => "write_descriptor",
            OperationKind::ToggleNotify => "toggle_notify",
            OperationKind::ReadRssi => "read_rssi",
            OperationKind::TurnAdapterOff => "turn_adapter_off",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority, lowest first.
///
/// The derived `Ord` is what the scheduler sorts on; declaration order is
/// therefore load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Trivial,
    /// Low
    Low,
    /// Ordinary reads and writes
    ForNormalReadsWrites,
    /// Service discovery and similar housekeeping
    Medium,
    /// Reads and writes inside an authentication or initialization phase
    ForPriorityReadsWrites,
    /// Connects and bonds the library issues on its own
    ForImplicitBondingAndConnecting,
    /// Connects and bonds the caller asked for
    ForExplicitBondingAndConnecting,
    /// Adapter-wide work that preempts everything
    Critical,
}

impl Priority {
    /// Alias used when callers do not care
    pub const NORMAL: Priority = Priority::ForNormalReadsWrites;
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Trivial => write!(f, "trivial"),
            Priority::Low => write!(f, "low"),
            Priority::ForNormalReadsWrites => write!(f, "normal"),
            Priority::Medium => write!(f, "medium"),
            Priority::ForPriorityReadsWrites => write!(f, "priority_reads_writes"),
            Priority::ForImplicitBondingAndConnecting => write!(f, "implicit_connect"),
            Priority::ForExplicitBondingAndConnecting => write!(f, "explicit_connect"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Built but not handed to the scheduler
    Created,
    /// Waiting in the queue
    Queued,
    /// Chosen for execution, preconditions checked
    Armed,
    /// Issued to the transport, waiting for the native reply
    Executing,
    /// Completed successfully
    Succeeded,
    /// The native stack reported a failure
    Failed,
    /// The transport refused to even start the call
    FailedImmediately,
    /// Ran longer than its timeout
    TimedOut,
    /// Discarded by a conflicting operation
    Cancelled,
    /// Preempted by a more urgent operation; resumes afterwards
    Interrupted,
    /// Made redundant by a later operation
    SoftlyCancelled,
    /// Removed from the queue without running
    ClearedFromQueue,
    /// Nothing to do, the desired outcome already holds
    Redundant,
}

impl OperationState {
    /// True for states an operation never leaves
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OperationState::Created
                | OperationState::Queued
                | OperationState::Armed
                | OperationState::Executing
        )
    }

    /// Whether the next operation may be dequeued inside the same tick.
    ///
    /// Failures wait for the next tick so a cascade of synchronous failures
    /// cannot recurse without bound.
    pub fn can_continue_immediately(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded
                | OperationState::Redundant
                | OperationState::Cancelled
                | OperationState::Interrupted
                | OperationState::SoftlyCancelled
                | OperationState::ClearedFromQueue
        )
    }

    /// Terminal states that count as a hardware failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OperationState::Failed | OperationState::FailedImmediately | OperationState::TimedOut
        )
    }

    /// Terminal states caused by another operation displacing this one
    pub fn is_displaced(&self) -> bool {
        matches!(
            self,
            OperationState::Cancelled
                | OperationState::Interrupted
                | OperationState::SoftlyCancelled
                | OperationState::ClearedFromQueue
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::Created => "created",
            OperationState::Queued => "queued",
            OperationState::Armed => "armed",
            OperationState::Executing => "executing",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::FailedImmediately => "failed_immediately",
            OperationState::TimedOut => "timed_out",
            OperationState::Cancelled => "cancelled",
            OperationState::Interrupted => "interrupted",
            OperationState::SoftlyCancelled => "softly_cancelled",
            OperationState::ClearedFromQueue => "cleared_from_queue",
            OperationState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::ForExplicitBondingAndConnecting);
        assert!(
            Priority::ForExplicitBondingAndConnecting > Priority::ForImplicitBondingAndConnecting
        );
        assert!(Priority::ForImplicitBondingAndConnecting > Priority::NORMAL);
        assert!(Priority::Medium > Priority::ForNormalReadsWrites);
        assert!(Priority::Trivial < Priority::Low);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OperationState::Queued.is_terminal());
        assert!(!OperationState::Executing.is_terminal());
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::ClearedFromQueue.is_terminal());
    }

    #[test]
    fn test_failures_defer_dequeue() {
        assert!(OperationState::Succeeded.can_continue_immediately());
        assert!(OperationState::Cancelled.can_continue_immediately());
        assert!(!OperationState::Failed.can_continue_immediately());
        assert!(!OperationState::FailedImmediately.can_continue_immediately());
        assert!(!OperationState::TimedOut.can_continue_immediately());
    }

    #[test]
    fn test_kind_classes() {
        assert!(OperationKind::Read.requires_connection());
        assert!(OperationKind::DiscoverServices.requires_connection());
        assert!(!OperationKind::Connect.requires_connection());
        assert!(!OperationKind::Bond.requires_connection());
        assert!(OperationKind::ToggleNotify.is_attribute_op());
        assert!(!OperationKind::ReadRssi.is_attribute_op());
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in OperationKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }
}
