//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Noor kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input or parameters. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (agent, policy, memory record).
    #[error("not found: {0}")]
    NotFound(String),

    /// A circuit breaker rejected the call without invoking it.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// An agent action or pipeline stage failed while executing.
    #[error("execution error: {0}")]
    Execution(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors, including recovered panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors (config file loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn circuit_open(msg: impl Into<String>) -> Self {
        Self::CircuitOpen(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when this error is a circuit-breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}
