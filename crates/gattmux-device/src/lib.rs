//! Per-device connection state machines for gattmux
//!
//! This crate turns operation outcomes and native callbacks into device
//! state, failure records and reconnect attempts:
//!
//! - [`FailureLedger`] - bounded, chronologically ordered ConnectFail history
//! - [`ReconnectPolicy`] - the decision function consulted after failures and
//!   while waiting, with [`DefaultReconnectPolicy`] as the stock cadence
//! - [`ConnectCycle`] - attempt counters and timers for one connect cycle
//! - [`DeviceManager`] - owns the [`Scheduler`](gattmux_scheduler::Scheduler),
//!   the transport and every [`Device`], and is the single update context
//!
//! # Connect cycle
//!
//! ```text
//! DISCONNECTED ─connect()─► CONNECTING ─► CONNECTED ─► DISCOVERING_SERVICES
//!      ▲                        │                             │
//!      │                  failure/drop                 [AUTHENTICATING]
//!      │                        ▼                      [INITIALIZING]
//!      └──── give up ◄── RECONNECTING_* ◄── policy            ▼
//!                                                       INITIALIZED
//! ```
//!
//! # Example
//!
//! ```rust
//! use gattmux_core::{test_utils::MockTransport, DeviceState, GattmuxConfig, NativeEvent, OperationKind};
//! use gattmux_device::DeviceManager;
//! use std::time::Duration;
//!
//! let mut manager = DeviceManager::new(GattmuxConfig::default(), MockTransport::new()).unwrap();
//! let device = "00:11:22:33:44:55".parse().unwrap();
//!
//! manager.connect(&device);
//! manager.tick(Duration::from_millis(20));
//! manager.on_native_event(NativeEvent::success(&device, OperationKind::Connect));
//! manager.tick(Duration::from_millis(20));
//! manager.on_native_event(NativeEvent::success(&device, OperationKind::DiscoverServices));
//!
//! assert!(manager.is(&device, DeviceState::Initialized));
//! ```

#![warn(missing_docs)]

pub mod cycle;
pub mod device;
mod executor;
pub mod ledger;
pub mod manager;
pub mod policy;

pub use cycle::{ConnectCycle, ConnectOptions, RetryWait, TransactionPhase};
pub use device::{Device, DeviceSnapshot};
pub use ledger::FailureLedger;
pub use manager::DeviceManager;
pub use policy::{
    DefaultReconnectPolicy, ReconnectDecision, ReconnectEvent, ReconnectPolicy,
    ReconnectQuestion,
};
