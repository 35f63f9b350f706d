//! Broker channel names shared with the CTP core.

/// Outbound command list (gateway -> core).
pub const CMD_QUEUE: &str = "ctp_cmd_queue";

/// Inbound trade-report list (core -> gateway).
pub const RSP_QUEUE: &str = "ctp_response_queue";

/// Tick topic prefix; the instrument id is the suffix.
pub const MARKET_TOPIC_PREFIX: &str = "market.";

/// Query-reply topic (core -> gateway).
pub const QUERY_REPLY_TOPIC: &str = "ctp_query_returns";

/// Core lifecycle topic, used for restart recovery.
pub const STATUS_TOPIC: &str = "ctp.status";

/// Status payload signalling the core (re)connected.
pub const STATUS_CONNECTED: &str = "connected";
