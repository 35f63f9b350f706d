//! Shared domain model and wire envelopes for the trading gateway.
//!
//! Everything that crosses the Redis bridge to the CTP core uses
//! PascalCase field names and the CTP single-character flag codes, so
//! the structs here carry explicit serde renames rather than Rust
//! casing.

pub mod envelope;
pub mod model;

pub use envelope::{Command, CommandType, MarketMessage, ResponseType, TradeResponse};
pub use model::{
    ConditionAction, ConditionOperator, ConditionOrderConfig, Direction, Instrument, OffsetFlag,
    Order, OrderLog, OrderStatus, PosiDirection, Position, Strategy, StrategyStatus, StrategyType,
    Subscription, Trade,
};
