//! Tick rate selection
//!
//! The update context ticks at `update_rate` while anything is queued,
//! executing or waiting on a reconnect. Once it has been quiet for
//! `idle_after` it drops to `idle_update_rate`, and the next command or
//! native event brings it straight back.

use gattmux_core::SchedulerConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct Pacer {
    busy_rate: Duration,
    idle_rate: Duration,
    idle_after: Duration,
    quiet_for: Duration,
    current: Duration,
}

impl Pacer {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        Self {
            busy_rate: config.update_rate,
            idle_rate: config.idle_update_rate,
            idle_after: config.idle_after,
            quiet_for: Duration::ZERO,
            current: config.update_rate,
        }
    }

    pub(crate) fn rate(&self) -> Duration {
        self.current
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.current == self.idle_rate && self.idle_rate != self.busy_rate
    }

    /// Account for one tick. Returns the new rate if it changed.
    pub(crate) fn after_tick(&mut self, dt: Duration, busy: bool) -> Option<Duration> {
        if busy {
            return self.wake();
        }
        self.quiet_for += dt;
        if self.quiet_for >= self.idle_after && self.current != self.idle_rate {
            self.current = self.idle_rate;
            return Some(self.current);
        }
        None
    }

    /// Something arrived. Returns the new rate if it changed.
    pub(crate) fn wake(&mut self) -> Option<Duration> {
        self.quiet_for = Duration::ZERO;
        if self.current != self.busy_rate {
            self.current = self.busy_rate;
            return Some(self.current);
        }
        None
    }
}
