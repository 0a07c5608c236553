//! Core types for the gattmux BLE connection core
//!
//! This crate holds the vocabulary shared by the scheduler, the device state
//! machines and the runtime:
//!
//! - **Identifiers** - [`DeviceId`] (normalized MAC), [`Target`], [`AttributeId`]
//! - **Operations** - [`OperationKind`], [`Priority`], [`OperationState`]
//! - **Device state** - [`DeviceState`] flags collected in a [`StateSet`], plus [`Intent`]
//! - **Failures** - [`ConnectFailCategory`], [`Timing`], [`ConnectFailEvent`]
//! - **Native boundary** - the [`Transport`] trait and inbound [`NativeEvent`]s
//! - **Configuration** - [`GattmuxConfig`] and its builder
//!
//! # Example
//!
//! ```rust
//! use gattmux_core::{DeviceId, DeviceState, GattmuxConfigBuilder, StateSet};
//! use std::time::Duration;
//!
//! let device: DeviceId = "aa-bb-cc-dd-ee-ff".parse().unwrap();
//! assert_eq!(device.as_str(), "AA:BB:CC:DD:EE:FF");
//!
//! let config = GattmuxConfigBuilder::new()
//!     .short_term(Duration::from_secs(1), Duration::from_secs(5))
//!     .max_history(10)
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! let state = StateSet::disconnected();
//! assert!(state.contains(DeviceState::Disconnected));
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod fail;
pub mod id;
pub mod native;
pub mod operation;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{
    DeviceConfig, GattmuxConfig, GattmuxConfigBuilder, HistoryConfig, ReconnectConfig,
    ReconnectPhaseConfig, SchedulerConfig, TimeoutConfig,
};
pub use error::{GattmuxError, Result};
pub use event::{DeviceEvent, ReconnectPhase};
pub use fail::{ConnectFailCategory, ConnectFailEvent, OperationFailure, Timing};
pub use id::{AttributeId, DeviceId, Target};
pub use native::{BondState, NativeEvent, NativeOutcome, Transport};
pub use operation::{OperationKind, OperationState, Priority};
pub use state::{DeviceState, Intent, StateSet};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
