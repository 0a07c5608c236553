//! Runtime error types

use gattmux_core::GattmuxError;
use thiserror::Error;

/// Errors returned by [`GattmuxHandle`](crate::GattmuxHandle)
#[derive(Error, Debug)]
pub enum RuntimeError {
    // ===== Core Errors =====
    /// The update context rejected the request
    #[error(transparent)]
    Core(#[from] GattmuxError),

    // ===== Channel Errors =====
    /// The service is gone or stopped listening
    #[error("Channel error: {0}")]
    Channel(String),

    /// The operation was dropped without reporting a terminal state
    #[error("Operation {0} ended without a completion")]
    CompletionLost(String),
}

impl RuntimeError {
    /// Whether retrying the same request could succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            RuntimeError::Core(e) => e.is_retriable(),
            RuntimeError::Channel(_) => false,
            RuntimeError::CompletionLost(_) => true,
        }
    }

    /// Stable error code for logs and metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Channel(_) => "RUNTIME_CHANNEL",
            RuntimeError::CompletionLost(_) => "COMPLETION_LOST",
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
