//! Outbound command encoder for the CTP core.
//!
//! Stateless: each operation builds a `Command` envelope with a fresh
//! request id and pushes it onto the command queue. Replies come back
//! asynchronously on the response queue or the query-reply topic.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::envelope::{Command, CommandType};
use common::model::Order;
use redis_bus::RedisBus;
use serde_json::{Map, Value};
use tracing::debug;

/// Capability for talking to the CTP core. Services depend on this
/// trait so tests can swap in a recording fake.
#[async_trait]
pub trait CtpCommander: Send + Sync {
    async fn subscribe(&self, instrument_id: &str) -> Result<()>;
    async fn unsubscribe(&self, instrument_id: &str) -> Result<()>;
    async fn insert_order(&self, order: &Order) -> Result<()>;
    async fn cancel_order(&self, order: &Order) -> Result<()>;
    async fn query_positions(&self, user_id: &str, instrument_id: &str) -> Result<()>;
    async fn query_account(&self, user_id: &str) -> Result<()>;
    async fn sync_instruments(&self) -> Result<()>;
}

fn stamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Build a SUBSCRIBE command for one instrument.
pub fn subscribe_command(instrument_id: &str) -> Command {
    let mut payload = Map::new();
    payload.insert("InstrumentID".to_string(), Value::from(instrument_id));
    Command {
        command_type: CommandType::Subscribe,
        request_id: format!("sub-{}-{}", instrument_id, stamp()),
        payload,
    }
}

/// Build an UNSUBSCRIBE command for one instrument.
pub fn unsubscribe_command(instrument_id: &str) -> Command {
    let mut payload = Map::new();
    payload.insert("InstrumentID".to_string(), Value::from(instrument_id));
    Command {
        command_type: CommandType::Unsubscribe,
        request_id: format!("unsub-{}-{}", instrument_id, stamp()),
        payload,
    }
}

/// Build an INSERT_ORDER command.
///
/// `OrderRef` doubles as the request id so RTN_ORDER / RTN_TRADE /
/// ERR_ORDER can be correlated back to the order.
pub fn insert_order_command(order: &Order) -> Command {
    // InvestorID falls back to UserID for orders the UI never filled
    // it in on (strategy-generated ones included).
    let investor_id = if order.investor_id.is_empty() {
        order.user_id.as_str()
    } else {
        order.investor_id.as_str()
    };

    let mut payload = Map::new();
    payload.insert("InstrumentID".to_string(), Value::from(order.instrument_id.as_str()));
    payload.insert("ExchangeID".to_string(), Value::from(order.exchange_id.as_str()));
    payload.insert("OrderRef".to_string(), Value::from(order.order_ref.as_str()));
    payload.insert("Direction".to_string(), Value::from(order.direction.as_flag()));
    payload.insert(
        "CombOffsetFlag".to_string(),
        Value::from(order.comb_offset_flag.as_flag()),
    );
    payload.insert("LimitPrice".to_string(), Value::from(order.limit_price));
    payload.insert(
        "VolumeTotalOriginal".to_string(),
        Value::from(order.volume_total_original),
    );
    // Fixed CTP flags: limit price, good-for-day, any volume,
    // immediate contingency, not force-close, speculation.
    payload.insert("OrderPriceType".to_string(), Value::from("2"));
    payload.insert("TimeCondition".to_string(), Value::from("3"));
    payload.insert("VolumeCondition".to_string(), Value::from("1"));
    payload.insert("ContingentCondition".to_string(), Value::from("1"));
    payload.insert("ForceCloseReason".to_string(), Value::from("0"));
    payload.insert("CombHedgeFlag".to_string(), Value::from("1"));
    payload.insert("UserID".to_string(), Value::from(order.user_id.as_str()));
    payload.insert("InvestorID".to_string(), Value::from(investor_id));

    Command {
        command_type: CommandType::InsertOrder,
        request_id: order.order_ref.clone(),
        payload,
    }
}

/// Build a CANCEL_ORDER command. Front/session ids from the first ack
/// are required by the core to locate the live order.
pub fn cancel_order_command(order: &Order) -> Command {
    let mut payload = Map::new();
    payload.insert("InstrumentID".to_string(), Value::from(order.instrument_id.as_str()));
    payload.insert("OrderRef".to_string(), Value::from(order.order_ref.as_str()));
    payload.insert("ExchangeID".to_string(), Value::from(order.exchange_id.as_str()));
    payload.insert("FrontID".to_string(), Value::from(order.front_id));
    payload.insert("SessionID".to_string(), Value::from(order.session_id));
    // '0' is delete.
    payload.insert("ActionFlag".to_string(), Value::from("0"));

    Command {
        command_type: CommandType::CancelOrder,
        request_id: format!("cancel-{}", order.order_ref),
        payload,
    }
}

/// Encoder writing to the Redis command queue.
pub struct CtpClient {
    bus: RedisBus,
}

impl CtpClient {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        debug!("sending {} (req {})", cmd.command_type, cmd.request_id);
        self.bus.push_command(&cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl CtpCommander for CtpClient {
    async fn subscribe(&self, instrument_id: &str) -> Result<()> {
        self.send(subscribe_command(instrument_id)).await
    }

    async fn unsubscribe(&self, instrument_id: &str) -> Result<()> {
        self.send(unsubscribe_command(instrument_id)).await
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.send(insert_order_command(order)).await
    }

    async fn cancel_order(&self, order: &Order) -> Result<()> {
        self.send(cancel_order_command(order)).await
    }

    async fn query_positions(&self, user_id: &str, instrument_id: &str) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("InvestorID".to_string(), Value::from(user_id));
        payload.insert("InstrumentID".to_string(), Value::from(instrument_id));
        self.send(Command {
            command_type: CommandType::QueryPositions,
            request_id: format!("query-pos-{}", stamp()),
            payload,
        })
        .await
    }

    async fn query_account(&self, user_id: &str) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("InvestorID".to_string(), Value::from(user_id));
        self.send(Command {
            command_type: CommandType::QueryAccount,
            request_id: format!("query-acc-{}", stamp()),
            payload,
        })
        .await
    }

    async fn sync_instruments(&self) -> Result<()> {
        self.send(Command {
            command_type: CommandType::QueryInstruments,
            request_id: format!("sync-inst-{}", stamp()),
            payload: Map::new(),
        })
        .await
    }
}
