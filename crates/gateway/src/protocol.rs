//! WebSocket protocol message types for browser/API clients.
//!
//! Market ticks and trade events are forwarded as raw bridge JSON;
//! only the control traffic below uses these tagged envelopes.

use serde::{Deserialize, Serialize};

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Filter this connection onto the given instruments.
    Subscribe { instruments: Vec<String> },
    /// Drop the connection-level filter for the given instruments.
    Unsubscribe { instruments: Vec<String> },
    /// Keepalive.
    Ping,
}

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirmation of subscription.
    Subscribed { instruments: Vec<String> },
    /// Confirmation of unsubscription.
    Unsubscribed { instruments: Vec<String> },
    /// Pong response to ping.
    Pong,
    /// Error notification.
    Error { message: String, code: String },
}
