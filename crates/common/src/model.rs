//! Domain entities shared by the gateway services.
//!
//! The flag enums (`Direction`, `OffsetFlag`, `OrderStatus`,
//! `PosiDirection`) serialize to the CTP single-character codes so a
//! struct can be round-tripped with the bridge without a translation
//! layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order direction ('0' buy / '1' sell on the wire).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    #[default]
    #[serde(rename = "0")]
    Buy,
    #[serde(rename = "1")]
    Sell,
}

impl Direction {
    /// The single-character wire code.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Direction::Buy => "0",
            Direction::Sell => "1",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "buy"),
            Direction::Sell => write!(f, "sell"),
        }
    }
}

/// Open/close flag (`CombOffsetFlag` in CTP terms).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OffsetFlag {
    #[default]
    #[serde(rename = "0")]
    Open,
    #[serde(rename = "1")]
    Close,
    #[serde(rename = "3")]
    CloseToday,
    #[serde(rename = "4")]
    CloseYesterday,
}

impl OffsetFlag {
    pub fn as_flag(&self) -> &'static str {
        match self {
            OffsetFlag::Open => "0",
            OffsetFlag::Close => "1",
            OffsetFlag::CloseToday => "3",
            OffsetFlag::CloseYesterday => "4",
        }
    }

    /// True for any of the closing variants.
    pub fn is_close(&self) -> bool {
        !matches!(self, OffsetFlag::Open)
    }
}

impl fmt::Display for OffsetFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetFlag::Open => write!(f, "open"),
            OffsetFlag::Close => write!(f, "close"),
            OffsetFlag::CloseToday => write!(f, "close_today"),
            OffsetFlag::CloseYesterday => write!(f, "close_yesterday"),
        }
    }
}

/// Order lifecycle status.
///
/// The exchange-reported codes ('0'..'c') come back on RTN_ORDER;
/// `Pending` and `Sent` are gateway-internal states stamped before the
/// first acknowledgement arrives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    #[serde(rename = "0")]
    AllTraded,
    #[serde(rename = "1")]
    PartTradedQueueing,
    #[serde(rename = "2")]
    PartTradedNotQueueing,
    #[serde(rename = "3")]
    NoTradeQueueing,
    #[serde(rename = "4")]
    NoTradeNotQueueing,
    #[serde(rename = "5")]
    Canceled,
    #[serde(rename = "a")]
    Unknown,
    #[serde(rename = "b")]
    NotTouched,
    #[serde(rename = "c")]
    Touched,
    #[default]
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "S")]
    Sent,
}

impl OrderStatus {
    /// Terminal states are sticky: once entered, no report may move the
    /// order out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::AllTraded | OrderStatus::Canceled | OrderStatus::NoTradeNotQueueing
        )
    }

    pub fn as_flag(&self) -> &'static str {
        match self {
            OrderStatus::AllTraded => "0",
            OrderStatus::PartTradedQueueing => "1",
            OrderStatus::PartTradedNotQueueing => "2",
            OrderStatus::NoTradeQueueing => "3",
            OrderStatus::NoTradeNotQueueing => "4",
            OrderStatus::Canceled => "5",
            OrderStatus::Unknown => "a",
            OrderStatus::NotTouched => "b",
            OrderStatus::Touched => "c",
            OrderStatus::Pending => "P",
            OrderStatus::Sent => "S",
        }
    }

    /// Parse an exchange-reported status code.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "0" => Some(OrderStatus::AllTraded),
            "1" => Some(OrderStatus::PartTradedQueueing),
            "2" => Some(OrderStatus::PartTradedNotQueueing),
            "3" => Some(OrderStatus::NoTradeQueueing),
            "4" => Some(OrderStatus::NoTradeNotQueueing),
            "5" => Some(OrderStatus::Canceled),
            "a" => Some(OrderStatus::Unknown),
            "b" => Some(OrderStatus::NotTouched),
            "c" => Some(OrderStatus::Touched),
            "P" => Some(OrderStatus::Pending),
            "S" => Some(OrderStatus::Sent),
            _ => None,
        }
    }
}

/// Position side ('2' long / '3' short on the wire).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PosiDirection {
    #[default]
    #[serde(rename = "2")]
    Long,
    #[serde(rename = "3")]
    Short,
}

impl PosiDirection {
    pub fn as_flag(&self) -> &'static str {
        match self {
            PosiDirection::Long => "2",
            PosiDirection::Short => "3",
        }
    }

    /// Which side of the book a fill lands on.
    ///
    /// Opening a buy builds the long side; closing with a sell unwinds
    /// it. The mirror holds for the short side.
    pub fn for_trade(direction: Direction, offset: OffsetFlag) -> Self {
        match (direction, offset.is_close()) {
            (Direction::Buy, false) => PosiDirection::Long,
            (Direction::Sell, true) => PosiDirection::Long,
            (Direction::Sell, false) => PosiDirection::Short,
            (Direction::Buy, true) => PosiDirection::Short,
        }
    }
}

/// The gateway's record of a client-submitted order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "InvestorID")]
    pub investor_id: String,
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: String,
    /// Client-side correlation handle; unique per order.
    #[serde(rename = "OrderRef")]
    pub order_ref: String,

    #[serde(rename = "Direction")]
    pub direction: Direction,
    #[serde(rename = "CombOffsetFlag")]
    pub comb_offset_flag: OffsetFlag,

    #[serde(rename = "LimitPrice")]
    pub limit_price: f64,
    #[serde(rename = "VolumeTotalOriginal")]
    pub volume_total_original: i32,
    #[serde(rename = "VolumeTraded")]
    pub volume_traded: i32,

    #[serde(rename = "OrderStatus")]
    pub order_status: OrderStatus,
    /// Exchange-assigned id; empty until the first acknowledgement.
    #[serde(rename = "OrderSysID")]
    pub order_sys_id: String,
    #[serde(rename = "StatusMsg")]
    pub status_msg: String,

    // Needed alongside OrderRef to cancel; populated after first ack.
    #[serde(rename = "FrontID")]
    pub front_id: i32,
    #[serde(rename = "SessionID")]
    pub session_id: i32,

    #[serde(rename = "TradingDay")]
    pub trading_day: String,

    #[serde(rename = "StrategyID", skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<i64>,

    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// One execution, matched to its parent order by `order_ref`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Trade {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "OrderID")]
    pub order_id: i64,
    #[serde(rename = "OrderRef")]
    pub order_ref: String,
    #[serde(rename = "OrderSysID")]
    pub order_sys_id: String,
    /// Exchange-assigned execution id; unique.
    #[serde(rename = "TradeID")]
    pub trade_id: String,
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: String,
    #[serde(rename = "Direction")]
    pub direction: Direction,
    #[serde(rename = "OffsetFlag")]
    pub offset_flag: OffsetFlag,
    #[serde(rename = "Price")]
    pub price: f64,
    #[serde(rename = "Volume")]
    pub volume: i32,
    #[serde(rename = "TradeDate")]
    pub trade_date: String,
    #[serde(rename = "TradeTime")]
    pub trade_time: String,
    #[serde(rename = "TradingDay")]
    pub trading_day: String,
    #[serde(rename = "StrategyID", skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<i64>,
}

/// Append-only audit of order status transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderLog {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "OrderID")]
    pub order_id: i64,
    #[serde(rename = "OldStatus")]
    pub old_status: String,
    #[serde(rename = "NewStatus")]
    pub new_status: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

/// A single side of exposure for one user and instrument.
///
/// Long and short positions of the same instrument are independent
/// rows, as the CTP core tracks them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "PosiDirection")]
    pub posi_direction: PosiDirection,
    /// '1' speculation; part of the composite key.
    #[serde(rename = "HedgeFlag")]
    pub hedge_flag: String,

    #[serde(rename = "Position")]
    pub position: i32,
    #[serde(rename = "YdPosition")]
    pub yd_position: i32,
    #[serde(rename = "TodayPosition")]
    pub today_position: i32,

    #[serde(rename = "PositionCost")]
    pub position_cost: f64,
    #[serde(rename = "AveragePrice")]
    pub average_price: f64,

    #[serde(rename = "TradingDay")]
    pub trading_day: String,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Composite key: one row per (user, instrument, side, hedge flag).
    pub fn key(&self) -> (String, String, PosiDirection, String) {
        (
            self.user_id.clone(),
            self.instrument_id.clone(),
            self.posi_direction,
            self.hedge_flag.clone(),
        )
    }
}

/// A tradable contract. Reference data, replaced wholesale on sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrument {
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: String,
    #[serde(rename = "InstrumentName")]
    pub instrument_name: String,
    #[serde(rename = "ProductID")]
    pub product_id: String,
    #[serde(rename = "PriceTick")]
    pub price_tick: f64,
    #[serde(rename = "VolumeMultiple")]
    pub volume_multiple: i32,
    #[serde(rename = "ExpireDate")]
    pub expire_date: String,
    #[serde(rename = "IsTrading")]
    pub is_trading: i32,
    #[serde(rename = "MarginRate")]
    pub margin_rate: f64,
}

/// A persisted market-data subscription. The set is global to the
/// gateway's single trading account; `instrument_id` is unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: String,
    /// UI display order.
    #[serde(rename = "Sorter")]
    pub sorter: i32,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

/// Supported strategy kinds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    #[default]
    ConditionOrder,
    GridTrading,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    #[default]
    Active,
    Stopped,
    Completed,
    Error,
}

/// A persisted strategy instance. `config` is the type-specific
/// parameter blob, parsed by the matching runner factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "InstrumentID")]
    pub instrument_id: String,
    #[serde(rename = "ExchangeID")]
    pub exchange_id: String,
    #[serde(rename = "Type")]
    pub strategy_type: StrategyType,
    #[serde(rename = "Status")]
    pub status: StrategyStatus,
    #[serde(rename = "Config")]
    pub config: serde_json::Value,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Comparison operator of a condition order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl ConditionOperator {
    /// Does `price` satisfy the condition against `trigger`?
    pub fn matches(&self, price: f64, trigger: f64) -> bool {
        match self {
            ConditionOperator::GreaterThan => price > trigger,
            ConditionOperator::GreaterOrEqual => price >= trigger,
            ConditionOperator::LessThan => price < trigger,
            ConditionOperator::LessOrEqual => price <= trigger,
        }
    }
}

/// What a triggered condition order does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionAction {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl ConditionAction {
    /// Map the action to the wire-level direction and offset pair.
    pub fn direction_offset(&self) -> (Direction, OffsetFlag) {
        match self {
            ConditionAction::OpenLong => (Direction::Buy, OffsetFlag::Open),
            ConditionAction::CloseLong => (Direction::Sell, OffsetFlag::Close),
            ConditionAction::OpenShort => (Direction::Sell, OffsetFlag::Open),
            ConditionAction::CloseShort => (Direction::Buy, OffsetFlag::Close),
        }
    }
}

/// Parsed parameters of a condition-order strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConditionOrderConfig {
    #[serde(rename = "TriggerPrice")]
    pub trigger_price: f64,
    #[serde(rename = "Operator")]
    pub operator: ConditionOperator,
    #[serde(rename = "Action")]
    pub action: ConditionAction,
    #[serde(rename = "Volume")]
    pub volume: i32,
}
