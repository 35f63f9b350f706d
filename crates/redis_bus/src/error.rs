//! Bus error types.

use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Broker-level failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// Redis command or connection error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload could not be serialized for the wire.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
