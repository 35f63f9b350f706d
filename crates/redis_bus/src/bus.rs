//! Typed access to the broker channels shared with the CTP core.

use crate::channels::{
    CMD_QUEUE, MARKET_TOPIC_PREFIX, QUERY_REPLY_TOPIC, RSP_QUEUE, STATUS_CONNECTED, STATUS_TOPIC,
};
use crate::error::Result;
use common::envelope::{Command, MarketMessage};
use futures::StreamExt;
use metrics::counter;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long a blocking response pop may wait before re-checking the
/// shutdown flag.
const POP_TIMEOUT_SECS: f64 = 1.0;

/// Shared Redis client wrapper for all gateway <-> core traffic.
#[derive(Clone)]
pub struct RedisBus {
    client: Arc<redis::Client>,
}

impl RedisBus {
    /// Create a bus handle for the given Redis URL.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get a multiplexed async connection for queue operations.
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    /// Push a command onto the outbound queue for the core to consume.
    pub async fn push_command(&self, cmd: &Command) -> Result<()> {
        let data = serde_json::to_string(cmd)?;
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(CMD_QUEUE, &data).await?;
        debug!("pushed {} command (req {})", cmd.command_type, cmd.request_id);
        Ok(())
    }

    /// Pop one trade report from the inbound queue.
    ///
    /// Blocks for at most one second; `Ok(None)` means the queue was
    /// empty, which lets the caller's loop observe cancellation.
    pub async fn pop_response(&self) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let entry: Option<(String, String)> = conn.brpop(RSP_QUEUE, POP_TIMEOUT_SECS).await?;
        Ok(entry.map(|(_, payload)| payload))
    }

    /// Consume the market tick topics into the internal fan-out channel.
    ///
    /// Pattern-subscribes to `market.*`; the channel suffix becomes the
    /// message symbol. Runs until the shutdown flag flips.
    pub async fn run_market_feed(
        &self,
        tx: mpsc::Sender<MarketMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let pattern = format!("{}*", MARKET_TOPIC_PREFIX);
        pubsub.psubscribe(&pattern).await?;
        info!("market feed subscribed to '{}'", pattern);

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!("market feed ended unexpectedly");
                        break;
                    };
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("unreadable payload on {}: {}", channel, e);
                            continue;
                        }
                    };
                    let Some(payload) = validate_payload(&payload) else {
                        warn!("dropping invalid JSON from {}", channel);
                        counter!("bus_invalid_payloads_total").increment(1);
                        continue;
                    };
                    let symbol = channel
                        .strip_prefix(MARKET_TOPIC_PREFIX)
                        .unwrap_or(&channel)
                        .to_string();
                    forward(&tx, MarketMessage::tick(symbol, payload));
                }
            }
        }

        info!("market feed stopped");
        Ok(())
    }

    /// Consume the query-reply topic into the internal fan-out channel.
    ///
    /// Replies carry no symbol; the dispatcher routes them to the trade
    /// response processor instead of the hub.
    pub async fn run_query_feed(
        &self,
        tx: mpsc::Sender<MarketMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(QUERY_REPLY_TOPIC).await?;
        info!("query feed subscribed to '{}'", QUERY_REPLY_TOPIC);

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!("query feed ended unexpectedly");
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("unreadable query reply: {}", e);
                            continue;
                        }
                    };
                    let Some(payload) = validate_payload(&payload) else {
                        warn!("dropping invalid JSON query reply");
                        counter!("bus_invalid_payloads_total").increment(1);
                        continue;
                    };
                    forward(&tx, MarketMessage::query_reply(payload));
                }
            }
        }

        info!("query feed stopped");
        Ok(())
    }

    /// Watch the core status topic and signal every reconnect.
    ///
    /// The core publishes `connected` after it (re)establishes its own
    /// upstream session, at which point all subscriptions are gone on
    /// its side and must be re-issued.
    pub async fn run_status_feed(
        &self,
        tx: mpsc::Sender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(STATUS_TOPIC).await?;
        info!("status feed subscribed to '{}'", STATUS_TOPIC);

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        warn!("status feed ended unexpectedly");
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("unreadable status payload: {}", e);
                            continue;
                        }
                    };
                    if payload.trim() == STATUS_CONNECTED {
                        info!("core reported connected, signalling resubscribe");
                        if tx.send(()).await.is_err() {
                            break;
                        }
                    } else {
                        debug!("core status: {}", payload.trim());
                    }
                }
            }
        }

        info!("status feed stopped");
        Ok(())
    }
}

/// Trim and validate an inbound topic payload; `None` drops it.
fn validate_payload(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_err() {
        return None;
    }
    Some(trimmed)
}

/// Non-blocking hand-off into the fan-out channel. A full channel
/// drops the message rather than stalling the broker reader.
fn forward(tx: &mpsc::Sender<MarketMessage>, msg: MarketMessage) {
    if tx.try_send(msg).is_err() {
        warn!("fan-out channel full, dropping message");
        counter!("bus_fanout_dropped_total").increment(1);
    }
}
