//! Bookkeeping for one CONNECTING_OVERALL span

use gattmux_core::{DeviceState, ReconnectPhase};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Optional caller-driven phases that follow service discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Enter AUTHENTICATING after discovery
    #[serde(default)]
    pub authenticate: bool,
    /// Enter INITIALIZING after discovery (or after authentication)
    #[serde(default)]
    pub initialize: bool,
}

impl ConnectOptions {
    /// No transaction phases
    pub fn plain() -> Self {
        Self::default()
    }

    /// Require an authentication phase
    pub fn with_authentication(mut self) -> Self {
        self.authenticate = true;
        self
    }

    /// Require an initialization phase
    pub fn with_initialization(mut self) -> Self {
        self.initialize = true;
        self
    }

    /// First flag entered once services are discovered, if any
    pub fn first_phase(&self) -> Option<DeviceState> {
        if self.authenticate {
            Some(DeviceState::Authenticating)
        } else if self.initialize {
            Some(DeviceState::Initializing)
        } else {
            None
        }
    }
}

/// Caller-driven phase being completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    /// AUTHENTICATING
    Authentication,
    /// INITIALIZING
    Initialization,
}

impl TransactionPhase {
    /// The flag the device holds during this phase
    pub fn state(&self) -> DeviceState {
        match self {
            TransactionPhase::Authentication => DeviceState::Authenticating,
            TransactionPhase::Initialization => DeviceState::Initializing,
        }
    }
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionPhase::Authentication => write!(f, "authentication"),
            TransactionPhase::Initialization => write!(f, "initialization"),
        }
    }
}

/// What the cycle is doing between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryWait {
    /// An attempt is in flight
    Attempting,
    /// The next attempt starts once this runs out
    Delay(Duration),
    /// Waiting on the policy with no attempt scheduled
    Persisting,
}

/// Attempt counters and timers for one connect cycle.
///
/// Times are measured on the manager's clock, which only advances with
/// ticks.
#[derive(Debug, Clone)]
pub struct ConnectCycle {
    started_at: Duration,
    phase: ReconnectPhase,
    phase_started_at: Duration,
    last_failure_at: Duration,
    failure_count: u32,
    highest_attempt: Option<DeviceState>,
    highest_total: Option<DeviceState>,
    previous_delay: Duration,
    wait: RetryWait,
    explicit: bool,
}

impl ConnectCycle {
    /// Start a cycle at `now`
    pub fn new(now: Duration, explicit: bool) -> Self {
        Self {
            started_at: now,
            phase: ReconnectPhase::ShortTerm,
            phase_started_at: now,
            last_failure_at: now,
            failure_count: 0,
            highest_attempt: None,
            highest_total: None,
            previous_delay: Duration::ZERO,
            wait: RetryWait::Attempting,
            explicit,
        }
    }

    /// Whether the caller started this cycle
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Current phase
    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Failures recorded so far
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Current wait state
    pub fn wait(&self) -> RetryWait {
        self.wait
    }

    /// Delay handed out by the last RetryAfter
    pub fn previous_delay(&self) -> Duration {
        self.previous_delay
    }

    /// Time since the cycle began
    pub fn total_elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.started_at)
    }

    /// Time since the current phase began
    pub fn phase_elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.phase_started_at)
    }

    /// Highest connection state of the current attempt
    pub fn highest_attempt(&self) -> Option<DeviceState> {
        self.highest_attempt
    }

    /// Highest connection state of the whole cycle
    pub fn highest_total(&self) -> Option<DeviceState> {
        self.highest_total
    }

    /// Fold a newly reached state into the high-water marks
    pub fn note_state(&mut self, state: Option<DeviceState>) {
        fn max(a: Option<DeviceState>, b: Option<DeviceState>) -> Option<DeviceState> {
            match (a, b) {
                (Some(x), Some(y)) => {
                    if y.connection_ordinal() > x.connection_ordinal() {
                        Some(y)
                    } else {
                        Some(x)
                    }
                }
                (x, None) => x,
                (None, y) => y,
            }
        }
        self.highest_attempt = max(self.highest_attempt, state);
        self.highest_total = max(self.highest_total, state);
    }

    /// A new attempt is starting
    pub fn begin_attempt(&mut self) {
        self.wait = RetryWait::Attempting;
        self.highest_attempt = None;
    }

    /// Count a failure. Returns `(failure_count, since_last, since_start)`.
    pub fn record_failure(&mut self, now: Duration) -> (u32, Duration, Duration) {
        self.failure_count += 1;
        let latest = now.saturating_sub(self.last_failure_at);
        self.last_failure_at = now;
        (self.failure_count, latest, self.total_elapsed(now))
    }

    /// Wait `delay` before the next attempt
    pub fn schedule(&mut self, delay: Duration) {
        self.previous_delay = delay;
        self.wait = RetryWait::Delay(delay);
    }

    /// Wait without a scheduled attempt
    pub fn persist(&mut self) {
        self.wait = RetryWait::Persisting;
    }

    /// Switch to another phase, restarting the phase clock
    pub fn enter_phase(&mut self, phase: ReconnectPhase, now: Duration) {
        self.phase = phase;
        self.phase_started_at = now;
    }

    /// Run down a pending delay. Returns `true` once it has elapsed.
    pub fn advance(&mut self, dt: Duration) -> bool {
        match self.wait {
            RetryWait::Delay(remaining) => {
                let remaining = remaining.saturating_sub(dt);
                self.wait = RetryWait::Delay(remaining);
                remaining.is_zero()
            }
            RetryWait::Attempting | RetryWait::Persisting => false,
        }
    }

    /// Whether the cycle is between attempts
    pub fn is_waiting(&self) -> bool {
        self.wait != RetryWait::Attempting
    }
}
