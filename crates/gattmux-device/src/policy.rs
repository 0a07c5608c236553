//! Reconnect policy engine
//!
//! A policy is a pure decision function. The device layer asks it two
//! questions during a connect cycle:
//!
//! - [`ReconnectQuestion::ShouldTryAgain`] right after a failure (or a drop
//!   of an initialized device), to decide whether and when to retry
//! - [`ReconnectQuestion::ShouldContinue`] on every tick while a retry is
//!   pending, to decide whether to keep waiting
//!
//! Failures classified EXPLICIT_DISCONNECT or ADAPTER_TURNING_OFF never
//! reach the policy.

use gattmux_core::{ConnectFailEvent, DeviceId, ReconnectConfig, ReconnectPhase, ReconnectPhaseConfig};
use std::time::Duration;

/// Which of the two questions is being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectQuestion {
    /// A failure just happened; retry?
    ShouldTryAgain,
    /// A retry is pending; keep waiting?
    ShouldContinue,
}

/// Everything a policy gets to see
#[derive(Debug, Clone)]
pub struct ReconnectEvent {
    /// Device being reconnected
    pub device: DeviceId,
    /// Which question is asked
    pub question: ReconnectQuestion,
    /// Phase of the cycle
    pub phase: ReconnectPhase,
    /// Failures so far in this cycle; zero for a drop after INITIALIZED
    pub failure_count: u32,
    /// Time since the current phase began
    pub phase_elapsed: Duration,
    /// Time since the cycle began
    pub total_elapsed: Duration,
    /// Delay handed out by the previous decision
    pub previous_delay: Duration,
    /// The failure that prompted the question, for ShouldTryAgain
    pub last_failure: Option<ConnectFailEvent>,
}

impl ReconnectEvent {
    /// No connection attempt of this cycle has failed yet
    pub fn is_first_failure(&self) -> bool {
        self.failure_count <= 1 && self.question == ReconnectQuestion::ShouldTryAgain
    }
}

/// What the policy wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Start a new attempt right away
    RetryNow,
    /// Start a new attempt after a delay
    RetryAfter(Duration),
    /// Give up on this phase
    Stop,
    /// Keep waiting without starting an attempt
    Persist,
}

impl std::fmt::Display for ReconnectDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectDecision::RetryNow => write!(f, "retry_now"),
            ReconnectDecision::RetryAfter(d) => write!(f, "retry_after({:?})", d),
            ReconnectDecision::Stop => write!(f, "stop"),
            ReconnectDecision::Persist => write!(f, "persist"),
        }
    }
}

/// Decides whether and when to retry
pub trait ReconnectPolicy: Send {
    /// Answer one question
    fn decide(&self, event: &ReconnectEvent) -> ReconnectDecision;
}

impl<F> ReconnectPolicy for F
where
    F: Fn(&ReconnectEvent) -> ReconnectDecision + Send,
{
    fn decide(&self, event: &ReconnectEvent) -> ReconnectDecision {
        self(event)
    }
}

/// Fixed cadence per phase, until the phase timeout runs out.
///
/// A drop after INITIALIZED (failure count zero) retries immediately.
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
    short_term: ReconnectPhaseConfig,
    long_term: ReconnectPhaseConfig,
}

impl DefaultReconnectPolicy {
    /// Build from configuration
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            short_term: config.short_term,
            long_term: config.long_term,
        }
    }

    fn phase(&self, phase: ReconnectPhase) -> &ReconnectPhaseConfig {
        match phase {
            ReconnectPhase::ShortTerm => &self.short_term,
            ReconnectPhase::LongTerm => &self.long_term,
        }
    }
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn decide(&self, event: &ReconnectEvent) -> ReconnectDecision {
        let phase = self.phase(event.phase);
        let expired = event.phase_elapsed >= phase.timeout;

        match event.question {
            ReconnectQuestion::ShouldTryAgain if event.failure_count == 0 => {
                ReconnectDecision::RetryNow
            }
            ReconnectQuestion::ShouldTryAgain if expired => ReconnectDecision::Stop,
            ReconnectQuestion::ShouldTryAgain => ReconnectDecision::RetryAfter(phase.rate),
            ReconnectQuestion::ShouldContinue if expired => ReconnectDecision::Stop,
            ReconnectQuestion::ShouldContinue => ReconnectDecision::Persist,
        }
    }
}
