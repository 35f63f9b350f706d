//! Gateway error types.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Broker read/write failure.
    #[error("bus error: {0}")]
    Bus(#[from] redis_bus::BusError),

    /// Entity missing; mutations become no-ops.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint hit (duplicate subscription, order ref).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Cancel requested on an order already in a sticky terminal state.
    #[error("order already in terminal state")]
    OrderTerminal,

    /// Malformed payload or unknown strategy type.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upstream dispatch failed; no partial state was persisted.
    #[error("failed to dispatch to gateway core: {0}")]
    Dispatch(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP-compatible status code for user-visible errors.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::OrderTerminal | GatewayError::InvalidInput(_) => 400,
            GatewayError::AlreadyExists(_) => 409,
            GatewayError::Bus(_) | GatewayError::Dispatch(_) => 502,
            GatewayError::Storage(_) | GatewayError::Json(_) | GatewayError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(GatewayError::NotFound("order".into()).http_status(), 404);
        assert_eq!(GatewayError::OrderTerminal.http_status(), 400);
        assert_eq!(GatewayError::AlreadyExists("sub".into()).http_status(), 409);
        assert_eq!(GatewayError::Dispatch("down".into()).http_status(), 502);
        assert_eq!(GatewayError::Internal("boom".into()).http_status(), 500);
    }
}
