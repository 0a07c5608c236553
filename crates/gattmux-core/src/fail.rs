//! ConnectFail taxonomy and records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::humantime_serde;
use crate::id::{AttributeId, DeviceId};
use crate::operation::{OperationKind, OperationState};
use crate::state::DeviceState;

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectFailCategory {
    /// `connect()` was called while already connecting or connected
    AlreadyConnectingOrConnected,
    /// The native connect call failed or timed out
    NativeConnectionFailed,
    /// Service discovery failed after the link came up
    DiscoveringServicesFailed,
    /// Bonding failed during the connect cycle
    BondingFailed,
    /// The caller's authentication phase failed
    AuthenticationFailed,
    /// The caller's initialization phase failed
    InitializationFailed,
    /// The link dropped in the middle of the connect cycle
    RogueDisconnect,
    /// The caller disconnected before the cycle finished
    ExplicitDisconnect,
    /// The adapter is being turned off
    AdapterTurningOff,
}

impl ConnectFailCategory {
    /// The attempt was abandoned on purpose rather than failing
    pub fn was_cancelled(&self) -> bool {
        matches!(
            self,
            ConnectFailCategory::ExplicitDisconnect | ConnectFailCategory::AdapterTurningOff
        )
    }

    /// Whether the reconnect policy may be consulted at all
    pub fn allows_retry(&self) -> bool {
        !self.was_cancelled() && *self != ConnectFailCategory::AlreadyConnectingOrConnected
    }
}

impl std::fmt::Display for ConnectFailCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectFailCategory::AlreadyConnectingOrConnected => "ALREADY_CONNECTING_OR_CONNECTED",
            ConnectFailCategory::NativeConnectionFailed => "NATIVE_CONNECTION_FAILED",
            ConnectFailCategory::DiscoveringServicesFailed => "DISCOVERING_SERVICES_FAILED",
            ConnectFailCategory::BondingFailed => "BONDING_FAILED",
            ConnectFailCategory::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ConnectFailCategory::InitializationFailed => "INITIALIZATION_FAILED",
            ConnectFailCategory::RogueDisconnect => "ROGUE_DISCONNECT",
            ConnectFailCategory::ExplicitDisconnect => "EXPLICIT_DISCONNECT",
            ConnectFailCategory::AdapterTurningOff => "ADAPTER_TURNING_OFF",
        };
        f.write_str(s)
    }
}

/// When, relative to the call, the failure showed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Timing {
    /// No native call was involved
    NotApplicable,
    /// The transport refused the call outright
    Immediately,
    /// The native stack reported failure after a while
    Eventually,
    /// No reply arrived before the operation timeout
    TimedOut,
}

impl Timing {
    /// Derive the timing from how the underlying operation ended
    pub fn from_operation_state(state: OperationState) -> Self {
        match state {
            OperationState::FailedImmediately => Timing::Immediately,
            OperationState::TimedOut => Timing::TimedOut,
            OperationState::Failed => Timing::Eventually,
            _ => Timing::NotApplicable,
        }
    }
}

impl std::fmt::Display for Timing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timing::NotApplicable => write!(f, "not_applicable"),
            Timing::Immediately => write!(f, "immediately"),
            Timing::Eventually => write!(f, "eventually"),
            Timing::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// The read/write that caused a transaction phase to fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Kind of the failed operation
    pub kind: OperationKind,
    /// Attribute it addressed
    pub attribute: Option<AttributeId>,
    /// How it ended
    pub state: OperationState,
    /// Native status reported with it
    pub native_status: Option<i32>,
}

/// One failed connection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectFailEvent {
    /// Device the attempt targeted
    pub device: DeviceId,
    /// Failure category
    pub category: ConnectFailCategory,
    /// Timing classification
    pub timing: Timing,
    /// Failures so far in this connect cycle, this one included
    pub failure_count: u32,
    /// Time since the previous failure (or the cycle start)
    #[serde(with = "humantime_serde")]
    pub attempt_time_latest: Duration,
    /// Time since the cycle started
    #[serde(with = "humantime_serde")]
    pub attempt_time_total: Duration,
    /// Native status code, when the stack gave one
    pub native_status: Option<i32>,
    /// Bond failure reason, for BONDING_FAILED
    pub bond_fail_reason: Option<i32>,
    /// Furthest the device got during this attempt
    pub highest_state_reached: Option<DeviceState>,
    /// Furthest the device got during the whole cycle
    pub highest_state_reached_total: Option<DeviceState>,
    /// Underlying read/write failure, for transaction failures
    pub operation_failure: Option<OperationFailure>,
    /// Wall-clock time of the failure
    pub timestamp: DateTime<Utc>,
}

impl ConnectFailEvent {
    /// A record with no attempt bookkeeping, for failures that are not part
    /// of a running cycle
    pub fn bare(device: DeviceId, category: ConnectFailCategory, timing: Timing) -> Self {
        Self {
            device,
            category,
            timing,
            failure_count: 0,
            attempt_time_latest: Duration::ZERO,
            attempt_time_total: Duration::ZERO,
            native_status: None,
            bond_fail_reason: None,
            highest_state_reached: None,
            highest_state_reached_total: None,
            operation_failure: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether the reconnect policy may be consulted for this failure
    pub fn allows_retry(&self) -> bool {
        self.category.allows_retry()
    }
}
