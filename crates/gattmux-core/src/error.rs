//! Error types for the connection core
//!
//! Scheduling conflicts and hardware failures are never surfaced through
//! these errors; they become terminal operation states and ConnectFail
//! records instead. `GattmuxError` covers what is left: bad arguments,
//! transport calls rejected synchronously, configuration problems and
//! closed channels.

use thiserror::Error;

/// Main error type for the connection core
#[derive(Error, Debug)]
pub enum GattmuxError {
    // ===== Addressing Errors =====
    /// Device address could not be parsed
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// Device is not known to the manager
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    // ===== Transport Errors =====
    /// The native stack refused to start the call
    #[error("Transport rejected {operation}: {reason}")]
    TransportRejected {
        /// Operation that was being issued
        operation: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// The adapter is off or unavailable
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    // ===== State Errors =====
    /// A transaction phase was completed while the device was not in it
    #[error("Device {device} is not in the {phase} phase")]
    NotInTransaction {
        /// Device address
        device: String,
        /// Phase that was reported
        phase: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl GattmuxError {
    /// Check if retrying the same call later could succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GattmuxError::TransportRejected { .. } | GattmuxError::AdapterUnavailable
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            GattmuxError::InvalidAddress(_) => "INVALID_ADDRESS",
            GattmuxError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            GattmuxError::TransportRejected { .. } => "TRANSPORT_REJECTED",
            GattmuxError::AdapterUnavailable => "ADAPTER_UNAVAILABLE",
            GattmuxError::NotInTransaction { .. } => "NOT_IN_TRANSACTION",
            GattmuxError::InvalidConfig(_) => "INVALID_CONFIG",
            GattmuxError::Internal(_) => "INTERNAL",
            GattmuxError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type for connection core operations
pub type Result<T> = std::result::Result<T, GattmuxError>;
