//! Redis bus adapter: the gateway's only channel to the CTP core.
//!
//! Four logical channels live on one broker:
//! - `ctp_cmd_queue` — outbound command list (we LPUSH, the core RPOPs)
//! - `ctp_response_queue` — inbound trade-report list (the core
//!   LPUSHes, we BRPOP with a bounded timeout)
//! - `market.<instrument>` — inbound tick topics, pattern-subscribed
//! - `ctp_query_returns` — inbound query-reply topic
//!
//! A fifth topic, `ctp.status`, carries core lifecycle transitions;
//! the literal payload `connected` means the peer restarted and every
//! active subscription must be re-issued.

pub mod bus;
pub mod channels;
pub mod error;

pub use bus::RedisBus;
pub use channels::{
    CMD_QUEUE, MARKET_TOPIC_PREFIX, QUERY_REPLY_TOPIC, RSP_QUEUE, STATUS_CONNECTED, STATUS_TOPIC,
};
pub use error::{BusError, Result};
