//! Trade response processor: reconciles orders, trades, and positions
//! against what the CTP core reports.
//!
//! Two consumers share `process`: the blocking pop loop on the
//! response queue, and the market dispatcher for replies arriving on
//! the query topic. A single consumer task serializes all order and
//! position mutations, so per-order transitions are linearizable.

use crate::error::Result;
use crate::hub::Notifier;
use crate::store::Store;
use chrono::Utc;
use common::envelope::{ResponseType, TradeResponse};
use common::model::{
    Instrument, OffsetFlag, Order, OrderLog, OrderStatus, PosiDirection, Position, Trade,
};
use metrics::counter;
use redis_bus::RedisBus;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Speculation hedge flag; the only one this gateway trades with.
const HEDGE_FLAG: &str = "1";

pub struct TradeResponseProcessor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl TradeResponseProcessor {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Consume the response queue until shutdown. Bad payloads are
    /// dropped; storage errors are logged and the loop keeps going,
    /// because the next report for the same ref re-attempts the
    /// reconciliation.
    pub async fn run(self: Arc<Self>, bus: RedisBus, shutdown: watch::Receiver<bool>) {
        info!("trade response listener started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match bus.pop_response().await {
                Ok(Some(raw)) => match serde_json::from_str::<TradeResponse>(&raw) {
                    Ok(resp) => self.process(resp).await,
                    Err(e) => {
                        warn!("failed to parse trade response: {}", e);
                        counter!("processor_invalid_responses_total").increment(1);
                    }
                },
                // Timeout; loop around and re-check the shutdown flag.
                Ok(None) => {}
                Err(e) => {
                    warn!("error popping response queue: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("trade response listener stopped");
    }

    /// Dispatch one response by type. Never fails the caller: inbound
    /// loops drop bad data and continue.
    pub async fn process(&self, resp: TradeResponse) {
        debug!("processing {} (req {})", resp.response_type, resp.request_id);
        let result = match resp.response_type {
            ResponseType::RtnOrder => self.handle_rtn_order(&resp).await,
            ResponseType::RtnTrade => self.handle_rtn_trade(&resp).await,
            ResponseType::ErrOrder => self.handle_err_order(&resp).await,
            ResponseType::QryPosRsp => self.handle_position_query(&resp.payload).await,
            ResponseType::QryInstrumentRsp => self.handle_instrument_query(&resp.payload).await,
            ResponseType::QryAccountRsp => {
                // Reserved; account reconciliation is not wired yet.
                debug!("account snapshot received: {}", resp.payload);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("failed to process {}: {}", resp.response_type, e);
            counter!("processor_errors_total").increment(1);
        }
    }

    /// Look up the order a report refers to. A miss is a race with the
    /// trading service's async persist: log and ignore, the next
    /// report will find the row.
    async fn order_for(&self, order_ref: &str) -> Result<Option<Order>> {
        let order = self.store.find_order_by_ref(order_ref).await?;
        if order.is_none() {
            warn!("no order for ref {}, ignoring report", order_ref);
            counter!("processor_orphan_reports_total").increment(1);
        }
        Ok(order)
    }

    async fn handle_rtn_order(&self, resp: &TradeResponse) -> Result<()> {
        let Some(mut order) = self.order_for(&resp.request_id).await? else {
            return Ok(());
        };

        if order.order_status.is_terminal() {
            debug!("order {} already terminal, ignoring RTN_ORDER", order.order_ref);
            return Ok(());
        }

        let payload = &resp.payload;
        let status_flag = str_field(payload, "OrderStatus");
        let order_sys_id = str_field(payload, "OrderSysID");
        let status_msg = str_field(payload, "StatusMsg");
        let front_id = i32_field(payload, "FrontID");
        let session_id = i32_field(payload, "SessionID");

        self.store
            .append_order_log(OrderLog {
                order_id: order.id,
                old_status: order.order_status.as_flag().to_string(),
                new_status: status_flag.clone(),
                message: status_msg.clone(),
                created_at: Utc::now(),
                ..Default::default()
            })
            .await?;

        if !status_flag.is_empty() {
            match OrderStatus::from_flag(&status_flag) {
                Some(status) => order.order_status = status,
                None => warn!("unknown order status '{}' for {}", status_flag, order.order_ref),
            }
        }
        if !order_sys_id.is_empty() {
            order.order_sys_id = order_sys_id;
        }
        if !status_msg.is_empty() {
            order.status_msg = status_msg;
        }
        if front_id != 0 {
            order.front_id = front_id;
        }
        if session_id != 0 {
            order.session_id = session_id;
        }

        self.store.update_order(&order).await?;
        self.notifier.broadcast_all(resp);
        Ok(())
    }

    async fn handle_rtn_trade(&self, resp: &TradeResponse) -> Result<()> {
        let Some(mut order) = self.order_for(&resp.request_id).await? else {
            return Ok(());
        };

        let payload = &resp.payload;
        let trade_id = str_field(payload, "TradeID");
        let price = f64_field(payload, "Price");
        let volume = i32_field(payload, "Volume");

        let trade = Trade {
            order_id: order.id,
            order_ref: order.order_ref.clone(),
            order_sys_id: order.order_sys_id.clone(),
            trade_id: trade_id.clone(),
            instrument_id: order.instrument_id.clone(),
            exchange_id: order.exchange_id.clone(),
            direction: order.direction,
            offset_flag: order.comb_offset_flag,
            price,
            volume,
            trade_date: non_empty_or(payload, "TradeDate", || {
                Utc::now().format("%Y%m%d").to_string()
            }),
            trade_time: non_empty_or(payload, "TradeTime", || {
                Utc::now().format("%H:%M:%S").to_string()
            }),
            trading_day: non_empty_or(payload, "TradingDay", || {
                Utc::now().format("%Y%m%d").to_string()
            }),
            strategy_id: order.strategy_id,
            ..Default::default()
        };

        // Replayed reports must not double-count fills or positions.
        if !self.store.insert_trade(trade).await? {
            info!("duplicate trade {} for {}, ignoring", trade_id, order.order_ref);
            return Ok(());
        }

        let filled = order.volume_traded + volume;
        order.volume_traded = filled.min(order.volume_total_original);
        order.order_status = if filled >= order.volume_total_original {
            OrderStatus::AllTraded
        } else {
            OrderStatus::PartTradedQueueing
        };
        self.store.update_order(&order).await?;

        self.apply_trade_to_position(&order, price, volume).await?;

        counter!("processor_trades_total").increment(1);
        self.notifier.broadcast_all(resp);
        Ok(())
    }

    async fn handle_err_order(&self, resp: &TradeResponse) -> Result<()> {
        let Some(mut order) = self.order_for(&resp.request_id).await? else {
            return Ok(());
        };

        if order.order_status.is_terminal() {
            debug!("order {} already terminal, ignoring ERR_ORDER", order.order_ref);
            return Ok(());
        }

        let error_msg = str_field(&resp.payload, "ErrorMsg");

        self.store
            .append_order_log(OrderLog {
                order_id: order.id,
                old_status: order.order_status.as_flag().to_string(),
                new_status: OrderStatus::NoTradeNotQueueing.as_flag().to_string(),
                message: error_msg.clone(),
                created_at: Utc::now(),
                ..Default::default()
            })
            .await?;

        order.order_status = OrderStatus::NoTradeNotQueueing;
        order.status_msg = error_msg;
        self.store.update_order(&order).await?;

        counter!("processor_rejected_orders_total").increment(1);
        self.notifier.broadcast_all(resp);
        Ok(())
    }

    async fn handle_position_query(&self, payload: &Value) -> Result<()> {
        let Some(entries) = payload.get("Positions").and_then(Value::as_array) else {
            warn!("position reply without Positions list");
            return Ok(());
        };
        let mut synced = 0usize;
        for entry in entries {
            match serde_json::from_value::<Position>(entry.clone()) {
                Ok(mut position) => {
                    if position.hedge_flag.is_empty() {
                        position.hedge_flag = HEDGE_FLAG.to_string();
                    }
                    position.updated_at = Utc::now();
                    self.store.upsert_position(position).await?;
                    synced += 1;
                }
                Err(e) => warn!("skipping malformed position entry: {}", e),
            }
        }
        info!("synchronized {} positions", synced);
        Ok(())
    }

    async fn handle_instrument_query(&self, payload: &Value) -> Result<()> {
        let Some(entries) = payload.get("Instruments").and_then(Value::as_array) else {
            warn!("instrument reply without Instruments list");
            return Ok(());
        };
        let mut synced = 0usize;
        for entry in entries {
            match serde_json::from_value::<Instrument>(entry.clone()) {
                Ok(instrument) => {
                    self.store.upsert_instrument(instrument).await?;
                    synced += 1;
                }
                Err(e) => warn!("skipping malformed instrument entry: {}", e),
            }
        }
        info!("synchronized {} instruments", synced);
        Ok(())
    }

    /// Fold one fill into the matching position row.
    ///
    /// Long and short sides are independent rows; opening accumulates
    /// cost and recomputes the average, closing shrinks volumes with a
    /// floor of zero.
    async fn apply_trade_to_position(&self, order: &Order, price: f64, volume: i32) -> Result<()> {
        let direction = PosiDirection::for_trade(order.direction, order.comb_offset_flag);
        let existing = self
            .store
            .find_position(&order.user_id, &order.instrument_id, direction, HEDGE_FLAG)
            .await?;

        let mut position = match existing {
            None => {
                if order.comb_offset_flag.is_close() {
                    warn!(
                        "close fill for {} {} with no open position",
                        order.user_id, order.instrument_id
                    );
                    return Ok(());
                }
                Position {
                    user_id: order.user_id.clone(),
                    instrument_id: order.instrument_id.clone(),
                    posi_direction: direction,
                    hedge_flag: HEDGE_FLAG.to_string(),
                    position: volume,
                    today_position: volume,
                    yd_position: 0,
                    position_cost: price * volume as f64,
                    average_price: price,
                    updated_at: Utc::now(),
                    ..Default::default()
                }
            }
            Some(mut position) => {
                if order.comb_offset_flag.is_close() {
                    position.position = (position.position - volume).max(0);
                    if order.comb_offset_flag == OffsetFlag::CloseToday {
                        position.today_position = (position.today_position - volume).max(0);
                    } else {
                        position.yd_position = (position.yd_position - volume).max(0);
                    }
                } else {
                    let new_total = position.position + volume;
                    position.position_cost += price * volume as f64;
                    if new_total > 0 {
                        position.average_price = position.position_cost / new_total as f64;
                    }
                    position.position = new_total;
                    position.today_position += volume;
                }
                position
            }
        };

        position.updated_at = Utc::now();
        self.store.upsert_position(position).await?;
        Ok(())
    }
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn non_empty_or(payload: &Value, key: &str, fallback: impl FnOnce() -> String) -> String {
    let value = str_field(payload, key);
    if value.is_empty() {
        fallback()
    } else {
        value
    }
}

/// The bridge is loose about numeric encoding; accept both JSON
/// numbers and numeric strings.
fn f64_field(payload: &Value, key: &str) -> f64 {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn i32_field(payload: &Value, key: &str) -> i32 {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default() as i32,
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::RecordingNotifier;
    use common::model::Direction;
    use serde_json::json;

    struct Fixture {
        processor: TradeResponseProcessor,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        Fixture {
            processor: TradeResponseProcessor::new(store.clone(), notifier.clone()),
            store,
            notifier,
        }
    }

    async fn seed_order(store: &MemoryStore, order_ref: &str, volume: i32) -> Order {
        store
            .create_order(Order {
                order_ref: order_ref.to_string(),
                user_id: "u1".to_string(),
                instrument_id: "rb2505".to_string(),
                exchange_id: "SHFE".to_string(),
                direction: Direction::Buy,
                comb_offset_flag: OffsetFlag::Open,
                volume_total_original: volume,
                order_status: OrderStatus::Sent,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn rtn_order(order_ref: &str, payload: Value) -> TradeResponse {
        TradeResponse {
            response_type: ResponseType::RtnOrder,
            request_id: order_ref.to_string(),
            payload,
        }
    }

    fn rtn_trade(order_ref: &str, trade_id: &str, price: f64, volume: i32) -> TradeResponse {
        TradeResponse {
            response_type: ResponseType::RtnTrade,
            request_id: order_ref.to_string(),
            payload: json!({"TradeID": trade_id, "Price": price, "Volume": volume}),
        }
    }

    #[tokio::test]
    async fn test_ack_then_fills_to_completion() {
        let f = fixture();
        let seeded = seed_order(&f.store, "O1", 3).await;

        // Queued acknowledgement.
        f.processor
            .process(rtn_order(
                "O1",
                json!({"OrderStatus": "3", "OrderSysID": "SYS1", "FrontID": 7, "SessionID": 42}),
            ))
            .await;

        let order = f.store.find_order_by_ref("O1").await.unwrap().unwrap();
        assert_eq!(order.order_status, OrderStatus::NoTradeQueueing);
        assert_eq!(order.order_sys_id, "SYS1");
        assert_eq!(order.front_id, 7);
        assert_eq!(order.session_id, 42);
        let logs = f.store.order_logs(seeded.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].old_status, "S");
        assert_eq!(logs[0].new_status, "3");

        // Partial fill.
        f.processor.process(rtn_trade("O1", "T1", 100.0, 2)).await;
        let order = f.store.find_order_by_ref("O1").await.unwrap().unwrap();
        assert_eq!(order.volume_traded, 2);
        assert_eq!(order.order_status, OrderStatus::PartTradedQueueing);

        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 2);
        assert_eq!(pos.today_position, 2);
        assert_eq!(pos.position_cost, 200.0);
        assert_eq!(pos.average_price, 100.0);

        // Completing fill.
        f.processor.process(rtn_trade("O1", "T2", 110.0, 1)).await;
        let order = f.store.find_order_by_ref("O1").await.unwrap().unwrap();
        assert_eq!(order.volume_traded, 3);
        assert_eq!(order.order_status, OrderStatus::AllTraded);

        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 3);
        assert_eq!(pos.position_cost, 310.0);
        assert!((pos.average_price - 310.0 / 3.0).abs() < 1e-9);

        let trades = f.store.trades_for_order(seeded.id).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!(!trades[0].trade_date.is_empty());
        assert!(!trades[0].trade_time.is_empty());
        // Ack + two fills, each broadcast to all clients.
        assert_eq!(f.notifier.events.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal_and_sticky() {
        let f = fixture();
        seed_order(&f.store, "O2", 1).await;

        f.processor
            .process(TradeResponse {
                response_type: ResponseType::ErrOrder,
                request_id: "O2".to_string(),
                payload: json!({"ErrorMsg": "margin"}),
            })
            .await;

        let order = f.store.find_order_by_ref("O2").await.unwrap().unwrap();
        assert_eq!(order.order_status, OrderStatus::NoTradeNotQueueing);
        assert_eq!(order.status_msg, "margin");
        assert_eq!(f.notifier.events.lock().unwrap().len(), 1);

        // A spurious late acknowledgement must not resurrect it.
        f.processor
            .process(rtn_order("O2", json!({"OrderStatus": "3"})))
            .await;
        let order = f.store.find_order_by_ref("O2").await.unwrap().unwrap();
        assert_eq!(order.order_status, OrderStatus::NoTradeNotQueueing);
    }

    #[tokio::test]
    async fn test_duplicate_trade_is_a_no_op() {
        let f = fixture();
        seed_order(&f.store, "O3", 5).await;

        f.processor.process(rtn_trade("O3", "T1", 100.0, 2)).await;
        f.processor.process(rtn_trade("O3", "T1", 100.0, 2)).await;

        let order = f.store.find_order_by_ref("O3").await.unwrap().unwrap();
        assert_eq!(order.volume_traded, 2);
        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 2);
        assert_eq!(pos.position_cost, 200.0);
    }

    #[tokio::test]
    async fn test_orphan_report_is_ignored() {
        let f = fixture();
        f.processor
            .process(rtn_order("missing", json!({"OrderStatus": "3"})))
            .await;
        f.processor.process(rtn_trade("missing", "T1", 100.0, 1)).await;
        assert!(f.notifier.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overfill_clamps_to_original_volume() {
        let f = fixture();
        seed_order(&f.store, "O4", 2).await;
        f.processor.process(rtn_trade("O4", "T1", 100.0, 5)).await;

        let order = f.store.find_order_by_ref("O4").await.unwrap().unwrap();
        assert_eq!(order.volume_traded, 2);
        assert_eq!(order.order_status, OrderStatus::AllTraded);
    }

    #[tokio::test]
    async fn test_close_decrements_the_right_buckets() {
        let f = fixture();

        // Build a long position of 5 (today).
        seed_order(&f.store, "O5", 5).await;
        f.processor.process(rtn_trade("O5", "T1", 100.0, 5)).await;

        // Sell close-today 2: long total 3, today 3.
        f.store
            .create_order(Order {
                order_ref: "O6".to_string(),
                user_id: "u1".to_string(),
                instrument_id: "rb2505".to_string(),
                direction: Direction::Sell,
                comb_offset_flag: OffsetFlag::CloseToday,
                volume_total_original: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        f.processor.process(rtn_trade("O6", "T2", 101.0, 2)).await;

        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 3);
        assert_eq!(pos.today_position, 3);
        assert_eq!(pos.yd_position, 0);

        // Sell close 9: volumes clamp at zero rather than going
        // negative.
        f.store
            .create_order(Order {
                order_ref: "O7".to_string(),
                user_id: "u1".to_string(),
                instrument_id: "rb2505".to_string(),
                direction: Direction::Sell,
                comb_offset_flag: OffsetFlag::Close,
                volume_total_original: 9,
                ..Default::default()
            })
            .await
            .unwrap();
        f.processor.process(rtn_trade("O7", "T3", 99.0, 9)).await;

        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 0);
        assert_eq!(pos.yd_position, 0);
    }

    #[tokio::test]
    async fn test_short_side_is_independent() {
        let f = fixture();
        seed_order(&f.store, "O8", 2).await;
        f.processor.process(rtn_trade("O8", "T1", 100.0, 2)).await;

        // Sell open lands on the short side.
        f.store
            .create_order(Order {
                order_ref: "O9".to_string(),
                user_id: "u1".to_string(),
                instrument_id: "rb2505".to_string(),
                direction: Direction::Sell,
                comb_offset_flag: OffsetFlag::Open,
                volume_total_original: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        f.processor.process(rtn_trade("O9", "T2", 100.0, 1)).await;

        let long = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        let short = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Short, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(long.position, 2);
        assert_eq!(short.position, 1);
    }

    #[tokio::test]
    async fn test_position_query_upserts_rows() {
        let f = fixture();
        f.processor
            .process(TradeResponse {
                response_type: ResponseType::QryPosRsp,
                request_id: "query-pos-1".to_string(),
                payload: json!({"Positions": [
                    {"UserID": "u1", "InstrumentID": "rb2505", "PosiDirection": "2",
                     "HedgeFlag": "1", "Position": 4, "YdPosition": 1, "TodayPosition": 3,
                     "PositionCost": 400.0, "AveragePrice": 100.0, "TradingDay": "20250101",
                     "UpdatedAt": "2025-01-01T00:00:00Z"},
                    {"broken": true}
                ]}),
            })
            .await;

        let pos = f
            .store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.position, 4);
        assert_eq!(pos.yd_position, 1);
    }

    #[tokio::test]
    async fn test_instrument_query_upserts_rows() {
        let f = fixture();
        f.processor
            .process(TradeResponse {
                response_type: ResponseType::QryInstrumentRsp,
                request_id: "sync-inst-1".to_string(),
                payload: json!({"Instruments": [
                    {"InstrumentID": "rb2505", "ExchangeID": "SHFE", "PriceTick": 1.0,
                     "VolumeMultiple": 10}
                ]}),
            })
            .await;
        let instrument = f.store.instrument("rb2505").unwrap();
        assert_eq!(instrument.exchange_id, "SHFE");
        assert_eq!(instrument.volume_multiple, 10);
    }

    #[test]
    fn test_numeric_fields_accept_strings() {
        let payload = json!({"Price": "101.5", "Volume": "3", "FrontID": 7});
        assert_eq!(f64_field(&payload, "Price"), 101.5);
        assert_eq!(i32_field(&payload, "Volume"), 3);
        assert_eq!(i32_field(&payload, "FrontID"), 7);
        assert_eq!(i32_field(&payload, "Missing"), 0);
    }
}
