//! Wire envelopes exchanged with the CTP core over the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Tag of an outbound command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Subscribe,
    Unsubscribe,
    InsertOrder,
    CancelOrder,
    QueryPositions,
    QueryAccount,
    QueryInstruments,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandType::Subscribe => "SUBSCRIBE",
            CommandType::Unsubscribe => "UNSUBSCRIBE",
            CommandType::InsertOrder => "INSERT_ORDER",
            CommandType::CancelOrder => "CANCEL_ORDER",
            CommandType::QueryPositions => "QUERY_POSITIONS",
            CommandType::QueryAccount => "QUERY_ACCOUNT",
            CommandType::QueryInstruments => "QUERY_INSTRUMENTS",
        };
        write!(f, "{}", s)
    }
}

/// Outbound instruction pushed onto the command queue, one JSON object
/// per list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "Type")]
    pub command_type: CommandType,
    /// Correlates replies; INSERT_ORDER uses the order's ref.
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "Payload")]
    pub payload: Map<String, Value>,
}

/// Tag of an inbound trade report or query reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    RtnOrder,
    RtnTrade,
    ErrOrder,
    QryPosRsp,
    QryAccountRsp,
    QryInstrumentRsp,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseType::RtnOrder => "RTN_ORDER",
            ResponseType::RtnTrade => "RTN_TRADE",
            ResponseType::ErrOrder => "ERR_ORDER",
            ResponseType::QryPosRsp => "QRY_POS_RSP",
            ResponseType::QryAccountRsp => "QRY_ACCOUNT_RSP",
            ResponseType::QryInstrumentRsp => "QRY_INSTRUMENT_RSP",
        };
        write!(f, "{}", s)
    }
}

/// Inbound envelope from the CTP core. `request_id` matches the
/// outbound OrderRef (trade reports) or query id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponse {
    #[serde(rename = "Type")]
    pub response_type: ResponseType,
    #[serde(rename = "RequestID", default)]
    pub request_id: String,
    #[serde(rename = "Payload", default)]
    pub payload: Value,
}

/// Internal routing envelope between the bus subscribers and the
/// dispatcher. An empty `symbol` marks a query reply rather than a
/// market tick.
#[derive(Debug, Clone)]
pub struct MarketMessage {
    pub symbol: String,
    /// Raw validated JSON exactly as received from the broker.
    pub payload: String,
}

impl MarketMessage {
    pub fn tick(symbol: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            payload: payload.into(),
        }
    }

    pub fn query_reply(payload: impl Into<String>) -> Self {
        Self {
            symbol: String::new(),
            payload: payload.into(),
        }
    }

    pub fn is_query_reply(&self) -> bool {
        self.symbol.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let mut payload = Map::new();
        payload.insert("InstrumentID".to_string(), Value::from("rb2505"));
        let cmd = Command {
            command_type: CommandType::Subscribe,
            request_id: "sub-rb2505-20250101000000".to_string(),
            payload,
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["Type"], "SUBSCRIBE");
        assert_eq!(v["RequestID"], "sub-rb2505-20250101000000");
        assert_eq!(v["Payload"]["InstrumentID"], "rb2505");
    }

    #[test]
    fn test_response_parses_bridge_json() {
        let resp: TradeResponse = serde_json::from_str(
            r#"{"Type":"RTN_ORDER","RequestID":"O1","Payload":{"OrderStatus":"3"}}"#,
        )
        .unwrap();
        assert_eq!(resp.response_type, ResponseType::RtnOrder);
        assert_eq!(resp.request_id, "O1");
        assert_eq!(resp.payload["OrderStatus"], "3");
    }

    #[test]
    fn test_query_reply_marker() {
        assert!(MarketMessage::query_reply("{}").is_query_reply());
        assert!(!MarketMessage::tick("rb2505", "{}").is_query_reply());
    }
}
