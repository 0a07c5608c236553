//! Async host for the gattmux connection core
//!
//! The scheduler and the device state machines are single-threaded by
//! construction. This crate gives them a home on one tokio task and exposes
//! a cloneable [`GattmuxHandle`] for everything else:
//!
//! - Caller requests travel over a bounded command channel
//! - Native callbacks travel through a [`NativeEventSink`], which transports
//!   may use from any thread
//! - The task ticks the scheduler at `update_rate`, dropping to
//!   `idle_update_rate` after `idle_after` without work
//! - [`DeviceEvent`](gattmux_core::DeviceEvent)s are broadcast to every
//!   subscriber
//!
//! # Example
//!
//! ```rust,no_run
//! use gattmux_core::{test_utils::MockTransport, GattmuxConfig};
//! use gattmux_runtime::{sink, GattmuxService};
//!
//! # async fn example() -> gattmux_runtime::Result<()> {
//! let (_sink, native) = sink::channel();
//! let (service, handle, mut events) =
//!     GattmuxService::new(GattmuxConfig::default(), MockTransport::new(), native)?;
//! tokio::spawn(service.run());
//!
//! let device = "00:11:22:33:44:55".parse().unwrap();
//! handle.connect(&device).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
mod pacer;
pub mod service;
pub mod sink;

pub use error::{Result, RuntimeError};
pub use service::{GattmuxCommand, GattmuxHandle, GattmuxService, OperationResult};
pub use sink::{NativeEventReceiver, NativeEventSink};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
