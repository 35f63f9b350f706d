//! Per-connection client state.

use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashSet;
use metrics::counter;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Capacity of each client's outbound queue. A slow consumer absorbs
/// at most this many messages before drops start.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// State for a single connected WebSocket client.
///
/// The outbound queue is bounded and enqueueing never blocks: the
/// writer task is the only consumer, and when the queue is full the
/// message is dropped for this client alone.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Bounded channel to the client's dedicated writer task.
    tx: mpsc::Sender<Message>,
    /// Instruments this connection wants ticks for.
    pub subscriptions: DashSet<String>,
    /// Timestamp when the client connected (ms).
    pub connected_at: i64,
    /// Timestamp of the last ping seen (ms).
    last_ping: AtomicI64,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            subscriptions: DashSet::new(),
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Non-blocking enqueue of a text frame. Returns false when the
    /// message was dropped (queue full) or the writer is gone.
    pub fn enqueue_text(&self, text: String) -> bool {
        match self.tx.try_send(Message::Text(text.into())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("client {} queue full, dropping message", self.id);
                counter!("gateway_client_dropped_messages_total").increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue a raw WebSocket frame (pings, pongs).
    pub fn enqueue_frame(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self, instrument_id: &str) -> bool {
        self.subscriptions.contains(instrument_id)
    }
}
