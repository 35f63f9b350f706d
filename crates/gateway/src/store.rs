//! Persistence port and the in-memory reference implementation.
//!
//! The relational database is an external collaborator; the core only
//! depends on the `Store` trait. `MemoryStore` backs the default
//! wiring and the test suite. A SQL adapter plugs in behind the same
//! trait without touching the services.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::model::{
    Instrument, Order, OrderLog, PosiDirection, Position, Strategy, StrategyStatus, Subscription,
    Trade,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Persistence operations the core needs from its storage collaborator.
#[async_trait]
pub trait Store: Send + Sync {
    // --- orders ---
    async fn create_order(&self, order: Order) -> Result<Order>;
    async fn find_order(&self, id: i64) -> Result<Option<Order>>;
    async fn find_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>>;
    async fn update_order(&self, order: &Order) -> Result<()>;
    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>>;

    // --- order logs ---
    async fn append_order_log(&self, log: OrderLog) -> Result<()>;
    async fn order_logs(&self, order_id: i64) -> Result<Vec<OrderLog>>;

    // --- trades ---
    /// Insert a trade; returns `false` (and stores nothing) when the
    /// exchange trade id was already recorded.
    async fn insert_trade(&self, trade: Trade) -> Result<bool>;
    async fn trades_for_order(&self, order_id: i64) -> Result<Vec<Trade>>;

    // --- positions ---
    async fn find_position(
        &self,
        user_id: &str,
        instrument_id: &str,
        direction: PosiDirection,
        hedge_flag: &str,
    ) -> Result<Option<Position>>;
    async fn upsert_position(&self, position: Position) -> Result<()>;
    async fn list_positions(&self, user_id: &str) -> Result<Vec<Position>>;

    // --- subscriptions ---
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;
    async fn create_subscription(&self, sub: Subscription) -> Result<Subscription>;
    /// Returns `false` when no record matched the instrument.
    async fn delete_subscription(&self, instrument_id: &str) -> Result<bool>;
    async fn reorder_subscriptions(&self, instrument_ids: &[String]) -> Result<()>;

    // --- strategies / instruments ---
    async fn active_strategies(&self) -> Result<Vec<Strategy>>;
    async fn upsert_instrument(&self, instrument: Instrument) -> Result<()>;
}

/// DashMap-backed store used by the default wiring and the tests.
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<i64, Order>,
    order_refs: DashMap<String, i64>,
    order_logs: Mutex<Vec<OrderLog>>,
    trades: DashMap<String, Trade>,
    positions: DashMap<(String, String, PosiDirection, String), Position>,
    subscriptions: DashMap<String, Subscription>,
    strategies: DashMap<i64, Strategy>,
    instruments: DashMap<String, Instrument>,

    next_order_id: AtomicI64,
    next_trade_id: AtomicI64,
    next_log_id: AtomicI64,
    next_sub_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a strategy row (strategy CRUD itself lives outside the core).
    pub fn put_strategy(&self, strategy: Strategy) {
        self.strategies.insert(strategy.id, strategy);
    }

    /// Seed a subscription row without going through the service.
    pub fn put_subscription(&self, sub: Subscription) {
        self.subscriptions.insert(sub.instrument_id.clone(), sub);
    }

    pub fn instrument(&self, instrument_id: &str) -> Option<Instrument> {
        self.instruments.get(instrument_id).map(|i| i.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_order(&self, mut order: Order) -> Result<Order> {
        if order.id == 0 {
            order.id = self.next_order_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if order.created_at.timestamp() == 0 {
            order.created_at = Utc::now();
        }
        order.updated_at = Utc::now();
        self.order_refs.insert(order.order_ref.clone(), order.id);
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn find_order(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.orders.get(&id).map(|o| o.clone()))
    }

    async fn find_order_by_ref(&self, order_ref: &str) -> Result<Option<Order>> {
        let Some(id) = self.order_refs.get(order_ref).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.orders.get(&id).map(|o| o.clone()))
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut updated = order.clone();
        updated.updated_at = Utc::now();
        self.orders.insert(updated.id, updated);
        Ok(())
    }

    async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn append_order_log(&self, mut log: OrderLog) -> Result<()> {
        log.id = self.next_log_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.order_logs
            .lock()
            .map_err(|_| GatewayError::Internal("order log lock poisoned".into()))?
            .push(log);
        Ok(())
    }

    async fn order_logs(&self, order_id: i64) -> Result<Vec<OrderLog>> {
        let logs = self
            .order_logs
            .lock()
            .map_err(|_| GatewayError::Internal("order log lock poisoned".into()))?;
        Ok(logs.iter().filter(|l| l.order_id == order_id).cloned().collect())
    }

    async fn insert_trade(&self, mut trade: Trade) -> Result<bool> {
        if self.trades.contains_key(&trade.trade_id) {
            return Ok(false);
        }
        trade.id = self.next_trade_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.trades.insert(trade.trade_id.clone(), trade);
        Ok(true)
    }

    async fn trades_for_order(&self, order_id: i64) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| t.order_id == order_id)
            .map(|t| t.clone())
            .collect();
        trades.sort_by_key(|t| t.id);
        Ok(trades)
    }

    async fn find_position(
        &self,
        user_id: &str,
        instrument_id: &str,
        direction: PosiDirection,
        hedge_flag: &str,
    ) -> Result<Option<Position>> {
        let key = (
            user_id.to_string(),
            instrument_id.to_string(),
            direction,
            hedge_flag.to_string(),
        );
        Ok(self.positions.get(&key).map(|p| p.clone()))
    }

    async fn upsert_position(&self, position: Position) -> Result<()> {
        self.positions.insert(position.key(), position);
        Ok(())
    }

    async fn list_positions(&self, user_id: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.clone())
            .collect())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut subs: Vec<Subscription> =
            self.subscriptions.iter().map(|s| s.clone()).collect();
        subs.sort_by_key(|s| s.sorter);
        Ok(subs)
    }

    async fn create_subscription(&self, mut sub: Subscription) -> Result<Subscription> {
        if self.subscriptions.contains_key(&sub.instrument_id) {
            return Err(GatewayError::AlreadyExists(format!(
                "subscription for {}",
                sub.instrument_id
            )));
        }
        if sub.id == 0 {
            sub.id = self.next_sub_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if sub.created_at.timestamp() == 0 {
            sub.created_at = Utc::now();
        }
        self.subscriptions.insert(sub.instrument_id.clone(), sub.clone());
        Ok(sub)
    }

    async fn delete_subscription(&self, instrument_id: &str) -> Result<bool> {
        Ok(self.subscriptions.remove(instrument_id).is_some())
    }

    async fn reorder_subscriptions(&self, instrument_ids: &[String]) -> Result<()> {
        for (i, instrument_id) in instrument_ids.iter().enumerate() {
            if let Some(mut sub) = self.subscriptions.get_mut(instrument_id) {
                sub.sorter = i as i32;
            }
        }
        Ok(())
    }

    async fn active_strategies(&self) -> Result<Vec<Strategy>> {
        let mut strategies: Vec<Strategy> = self
            .strategies
            .iter()
            .filter(|s| s.status == StrategyStatus::Active)
            .map(|s| s.clone())
            .collect();
        strategies.sort_by_key(|s| s.id);
        Ok(strategies)
    }

    async fn upsert_instrument(&self, instrument: Instrument) -> Result<()> {
        self.instruments
            .insert(instrument.instrument_id.clone(), instrument);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{Direction, OffsetFlag};

    #[tokio::test]
    async fn test_order_lookup_by_ref() {
        let store = MemoryStore::new();
        let order = store
            .create_order(Order {
                order_ref: "O1".to_string(),
                user_id: "u1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(order.id > 0);

        let found = store.find_order_by_ref("O1").await.unwrap().unwrap();
        assert_eq!(found.id, order.id);
        assert!(store.find_order_by_ref("O2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trade_insert_is_idempotent_by_trade_id() {
        let store = MemoryStore::new();
        let trade = Trade {
            trade_id: "T1".to_string(),
            order_id: 1,
            volume: 2,
            ..Default::default()
        };
        assert!(store.insert_trade(trade.clone()).await.unwrap());
        assert!(!store.insert_trade(trade).await.unwrap());
        assert_eq!(store.trades_for_order(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_position_keyed_by_side() {
        let store = MemoryStore::new();
        store
            .upsert_position(Position {
                user_id: "u1".to_string(),
                instrument_id: "rb2505".to_string(),
                posi_direction: PosiDirection::Long,
                hedge_flag: "1".to_string(),
                position: 3,
                ..Default::default()
            })
            .await
            .unwrap();

        // The short side of the same instrument is an independent row.
        let short = store
            .find_position("u1", "rb2505", PosiDirection::Short, "1")
            .await
            .unwrap();
        assert!(short.is_none());

        let long = store
            .find_position("u1", "rb2505", PosiDirection::Long, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(long.position, 3);
    }

    #[tokio::test]
    async fn test_subscription_uniqueness() {
        let store = MemoryStore::new();
        store
            .create_subscription(Subscription {
                instrument_id: "ag2506".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(
            store
                .create_subscription(Subscription {
                    instrument_id: "ag2506".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap_err(),
            GatewayError::AlreadyExists(_)
        ));
        assert!(store.delete_subscription("ag2506").await.unwrap());
        assert!(!store.delete_subscription("ag2506").await.unwrap());
    }

    #[tokio::test]
    async fn test_active_strategies_filter() {
        let store = MemoryStore::new();
        store.put_strategy(Strategy {
            id: 1,
            status: StrategyStatus::Active,
            ..Default::default()
        });
        store.put_strategy(Strategy {
            id: 2,
            status: StrategyStatus::Stopped,
            ..Default::default()
        });
        let active = store.active_strategies().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }

    #[tokio::test]
    async fn test_reorder_rewrites_sorters() {
        let store = MemoryStore::new();
        for (i, inst) in ["a", "b", "c"].iter().enumerate() {
            store
                .create_subscription(Subscription {
                    instrument_id: inst.to_string(),
                    sorter: i as i32,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store
            .reorder_subscriptions(&["c".to_string(), "a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let subs = store.list_subscriptions().await.unwrap();
        let order: Vec<&str> = subs.iter().map(|s| s.instrument_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_trade_mentions_direction_offset() {
        // Smoke check that wire enums default sensibly for seeded rows.
        let t = Trade {
            direction: Direction::Buy,
            offset_flag: OffsetFlag::Open,
            ..Default::default()
        };
        assert_eq!(t.direction.as_flag(), "0");
        assert_eq!(t.offset_flag.as_flag(), "0");
    }
}
