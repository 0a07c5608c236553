//! Single-flight priority scheduler for BLE hardware operations
//!
//! The native Bluetooth stack cannot be trusted with concurrent GATT calls,
//! so every connect, disconnect, discovery, bond, read and write goes
//! through one [`Scheduler`]. It keeps a priority-ordered queue and exactly
//! one executing slot, and is driven by a cooperative time step instead of
//! threads or futures.
//!
//! # Lifecycle
//!
//! ```text
//!   enqueue ──► Queued ──tick/pump──► Armed ──► Executing ──end──► terminal
//!                 │                                 │
//!                 └─ cancelled / cleared ◄──────────┴─ cancelled / interrupted
//! ```
//!
//! Conflicts between operations (a Disconnect arriving while a Connect runs,
//! an implicit Bond arriving during a Write, ...) are resolved by the
//! [`compat`] table, never by reordering unrelated operations.
//!
//! # Example
//!
//! ```rust
//! use gattmux_core::{DeviceId, OperationKind, SchedulerConfig, TimeoutConfig};
//! use gattmux_scheduler::{Execution, Executor, Operation, Scheduler};
//! use std::time::Duration;
//!
//! struct Radio;
//!
//! impl Executor for Radio {
//!     fn is_armable(&self, _op: &Operation) -> bool {
//!         true
//!     }
//!     fn execute(&mut self, _op: &Operation) -> Execution {
//!         Execution::Started
//!     }
//! }
//!
//! let device: DeviceId = "00:11:22:33:44:55".parse().unwrap();
//! let mut scheduler = Scheduler::new(&SchedulerConfig::default(), TimeoutConfig::default());
//! scheduler.enqueue(Operation::connect(&device, true));
//! scheduler.tick(Duration::from_millis(20), &mut Radio);
//!
//! assert!(scheduler.is_current(OperationKind::Connect, &device.into()));
//! ```

#![warn(missing_docs)]

pub mod compat;
pub mod operation;
pub mod scheduler;

pub use compat::{Relation, Slot};
pub use operation::{Completion, CompletionCallback, OpId, Operation};
pub use scheduler::{Execution, Executor, Scheduler};
