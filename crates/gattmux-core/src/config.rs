//! Configuration for the connection core
//!
//! All values are read-only inputs to the scheduler, the device state
//! machines and the reconnect policy. Durations are written in humantime
//! form (`"20ms"`, `"12s 500ms"`, `"5m"`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{GattmuxError, Result};
use crate::operation::OperationKind;

/// Default tick rate while work is pending
pub const DEFAULT_UPDATE_RATE: Duration = Duration::from_millis(20);

/// Default operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(12_500);

/// How long adapter shutdown may hold the executing slot
pub const DEFAULT_ADAPTER_OFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Default failure history bound
pub const DEFAULT_MAX_HISTORY: usize = 25;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GattmuxConfig {
    /// Scheduler pacing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-operation timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Automatic reconnection
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Failure history
    #[serde(default)]
    pub history: HistoryConfig,

    /// Per-device connect behavior
    #[serde(default)]
    pub device: DeviceConfig,
}

impl GattmuxConfig {
    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.update_rate.is_zero() {
            return Err(GattmuxError::InvalidConfig(
                "scheduler.update_rate must be greater than zero".into(),
            ));
        }
        if self.scheduler.idle_update_rate < self.scheduler.update_rate {
            return Err(GattmuxError::InvalidConfig(
                "scheduler.idle_update_rate must not be faster than update_rate".into(),
            ));
        }
        if self.scheduler.max_dequeue_depth == 0 {
            return Err(GattmuxError::InvalidConfig(
                "scheduler.max_dequeue_depth must be at least 1".into(),
            ));
        }
        if self.reconnect.short_term.rate.is_zero() || self.reconnect.long_term.rate.is_zero() {
            return Err(GattmuxError::InvalidConfig(
                "reconnect rates must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick rate while operations are pending
    #[serde(with = "humantime_serde", default = "default_update_rate")]
    pub update_rate: Duration,

    /// Tick rate once the scheduler has been quiet for `idle_after`
    #[serde(with = "humantime_serde", default = "default_idle_update_rate")]
    pub idle_update_rate: Duration,

    /// Quiet period before dropping to the idle rate
    #[serde(with = "humantime_serde", default = "default_idle_after")]
    pub idle_after: Duration,

    /// Minimum gap between one operation ending and the next starting (0 = none)
    #[serde(with = "humantime_serde", default)]
    pub delay_between_operations: Duration,

    /// Maximum operations dequeued back-to-back inside one tick
    #[serde(default = "default_max_dequeue_depth")]
    pub max_dequeue_depth: usize,
}

fn default_update_rate() -> Duration {
    DEFAULT_UPDATE_RATE
}

fn default_idle_update_rate() -> Duration {
    Duration::from_millis(500)
}

fn default_idle_after() -> Duration {
    Duration::from_secs(20)
}

fn default_max_dequeue_depth() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_rate: default_update_rate(),
            idle_update_rate: default_idle_update_rate(),
            idle_after: default_idle_after(),
            delay_between_operations: Duration::ZERO,
            max_dequeue_depth: default_max_dequeue_depth(),
        }
    }
}

/// Timeout table keyed by operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for kinds without an override
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub default: Duration,

    /// Per-kind overrides; `None` (written `"none"`) disables the timeout
    #[serde(with = "timeout_map", default = "default_timeout_overrides")]
    pub overrides: BTreeMap<OperationKind, Option<Duration>>,
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_timeout_overrides() -> BTreeMap<OperationKind, Option<Duration>> {
    let mut map = BTreeMap::new();
    map.insert(OperationKind::Disconnect, None);
    map.insert(OperationKind::Unbond, None);
    map.insert(OperationKind::TurnAdapterOff, Some(DEFAULT_ADAPTER_OFF_TIMEOUT));
    map
}

impl TimeoutConfig {
    /// Timeout for an operation kind, if it has one
    pub fn timeout_for(&self, kind: OperationKind) -> Option<Duration> {
        match self.overrides.get(&kind) {
            Some(setting) => *setting,
            None => Some(self.default),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: default_operation_timeout(),
            overrides: default_timeout_overrides(),
        }
    }
}

/// Cadence and give-up time for one reconnect phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPhaseConfig {
    /// Delay between attempts
    #[serde(with = "humantime_serde")]
    pub rate: Duration,

    /// Time after which the phase gives up
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Automatic reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Master switch for the whole retry loop
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,

    /// Phase entered right after a failure or drop
    #[serde(default = "default_short_term")]
    pub short_term: ReconnectPhaseConfig,

    /// Whether to fall back to long-term retries once short-term gives up
    #[serde(default)]
    pub long_term_enabled: bool,

    /// Slow phase entered after short-term gives up
    #[serde(default = "default_long_term")]
    pub long_term: ReconnectPhaseConfig,
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_short_term() -> ReconnectPhaseConfig {
    ReconnectPhaseConfig {
        rate: Duration::from_secs(1),
        timeout: Duration::from_secs(5),
    }
}

fn default_long_term() -> ReconnectPhaseConfig {
    ReconnectPhaseConfig {
        rate: Duration::from_secs(3),
        timeout: Duration::from_secs(300), // 5 minutes
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            short_term: default_short_term(),
            long_term_enabled: false,
            long_term: default_long_term(),
        }
    }
}

/// Failure history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum ConnectFail records kept per device
    #[serde(default = "default_max_history")]
    pub max_size: usize,
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

impl HistoryConfig {
    /// Effective bound; never below 1
    pub fn bound(&self) -> usize {
        self.max_size.max(1)
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_history(),
        }
    }
}

/// Per-device connect behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bond right after the link comes up, before service discovery
    #[serde(default)]
    pub bond_on_connect: bool,

    /// Reserved for MTU and connection-priority negotiation; currently ignored
    #[serde(default)]
    pub auto_negotiate_on_connect: bool,
}

/// Builder for GattmuxConfig
#[derive(Debug, Default)]
pub struct GattmuxConfigBuilder {
    config: GattmuxConfig,
}

impl GattmuxConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the busy tick rate
    pub fn update_rate(mut self, rate: Duration) -> Self {
        self.config.scheduler.update_rate = rate;
        self
    }

    /// Set the idle tick rate and the quiet period before it applies
    pub fn idle_rate(mut self, rate: Duration, after: Duration) -> Self {
        self.config.scheduler.idle_update_rate = rate;
        self.config.scheduler.idle_after = after;
        self
    }

    /// Set the gap enforced between operations
    pub fn delay_between_operations(mut self, delay: Duration) -> Self {
        self.config.scheduler.delay_between_operations = delay;
        self
    }

    /// Set the default operation timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.default = timeout;
        self
    }

    /// Override the timeout for one kind (`None` disables it)
    pub fn timeout_for(mut self, kind: OperationKind, timeout: Option<Duration>) -> Self {
        self.config.timeouts.overrides.insert(kind, timeout);
        self
    }

    /// Enable or disable automatic reconnection
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set the short-term cadence and timeout
    pub fn short_term(mut self, rate: Duration, timeout: Duration) -> Self {
        self.config.reconnect.short_term = ReconnectPhaseConfig { rate, timeout };
        self
    }

    /// Enable long-term reconnection with the given cadence and timeout
    pub fn long_term(mut self, rate: Duration, timeout: Duration) -> Self {
        self.config.reconnect.long_term_enabled = true;
        self.config.reconnect.long_term = ReconnectPhaseConfig { rate, timeout };
        self
    }

    /// Set the failure history bound (clamped to at least 1)
    pub fn max_history(mut self, size: usize) -> Self {
        self.config.history.max_size = size.max(1);
        self
    }

    /// Bond automatically on every connect
    pub fn bond_on_connect(mut self, enabled: bool) -> Self {
        self.config.device.bond_on_connect = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> GattmuxConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod timeout_map {
    use serde::ser::SerializeMap;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::operation::OperationKind;

    const DISABLED: &str = "none";

    pub fn serialize<S>(
        map: &BTreeMap<OperationKind, Option<Duration>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (kind, timeout) in map {
            let text = match timeout {
                Some(d) => humantime::format_duration(*d).to_string(),
                None => DISABLED.to_string(),
            };
            out.serialize_entry(kind, &text)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<OperationKind, Option<Duration>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<OperationKind, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(kind, text)| {
                if text == DISABLED {
                    Ok((kind, None))
                } else {
                    humantime::parse_duration(&text)
                        .map(|d| (kind, Some(d)))
                        .map_err(serde::de::Error::custom)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GattmuxConfig::default();
        assert_eq!(config.scheduler.update_rate, Duration::from_millis(20));
        assert_eq!(config.scheduler.max_dequeue_depth, 10);
        assert_eq!(config.history.bound(), 25);
        assert!(config.reconnect.enabled);
        assert!(!config.reconnect.long_term_enabled);
        assert_eq!(config.reconnect.short_term.rate, Duration::from_secs(1));
        assert_eq!(config.reconnect.short_term.timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_table() {
        let config = TimeoutConfig::default();
        assert_eq!(
            config.timeout_for(OperationKind::Connect),
            Some(Duration::from_millis(12_500))
        );
        assert_eq!(config.timeout_for(OperationKind::Disconnect), None);
        assert_eq!(
            config.timeout_for(OperationKind::TurnAdapterOff),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_config_builder() {
        let config = GattmuxConfigBuilder::new()
            .update_rate(Duration::from_millis(10))
            .timeout_for(OperationKind::Read, Some(Duration::from_secs(2)))
            .long_term(Duration::from_secs(10), Duration::from_secs(60))
            .max_history(0)
            .bond_on_connect(true)
            .build();

        assert_eq!(config.scheduler.update_rate, Duration::from_millis(10));
        assert_eq!(
            config.timeouts.timeout_for(OperationKind::Read),
            Some(Duration::from_secs(2))
        );
        assert!(config.reconnect.long_term_enabled);
        assert_eq!(config.history.bound(), 1);
        assert!(config.device.bond_on_connect);
    }

    #[test]
    fn test_history_floor() {
        let config = HistoryConfig { max_size: 0 };
        assert_eq!(config.bound(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = GattmuxConfigBuilder::new()
            .update_rate(Duration::ZERO)
            .build();
        assert!(matches!(
            config.validate(),
            Err(GattmuxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_round_trip_uses_humantime() {
        let json = r#"{
            "scheduler": { "update_rate": "10ms" },
            "timeouts": { "default": "3s", "overrides": { "write": "none", "read": "1s" } },
            "reconnect": { "short_term": { "rate": "500ms", "timeout": "2s" } },
            "history": { "max_size": 4 }
        }"#;
        let config: GattmuxConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.scheduler.update_rate, Duration::from_millis(10));
        assert_eq!(config.scheduler.idle_update_rate, Duration::from_millis(500));
        assert_eq!(config.timeouts.timeout_for(OperationKind::Write), None);
        assert_eq!(
            config.timeouts.timeout_for(OperationKind::Read),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            config.timeouts.timeout_for(OperationKind::Connect),
            Some(Duration::from_secs(3))
        );
        assert_eq!(config.reconnect.short_term.rate, Duration::from_millis(500));
        assert_eq!(config.history.bound(), 4);

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"update_rate\":\"10ms\""));
    }
}
