//! In-memory strategy engine.
//!
//! Active strategies are loaded wholesale from the store and indexed
//! by instrument so a tick only touches the runners that care about
//! it. Runner state is process-local; a restart re-arms every active
//! condition order.

use crate::error::Result;
use crate::store::Store;
use common::model::{ConditionOrderConfig, Order, OrderStatus, Strategy, StrategyType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// One running strategy instance. `on_tick` returns the order to place
/// when the strategy fires, or `None`.
pub trait StrategyRunner: Send + Sync {
    fn strategy_id(&self) -> i64;
    fn instrument_id(&self) -> &str;
    fn on_tick(&self, price: f64) -> Option<Order>;
}

/// Simple threshold condition order.
///
/// The trigger flag is an atomic compare-exchange, so even if two
/// ticks raced through the index the order would be emitted exactly
/// once per process lifetime.
pub struct ConditionOrderRunner {
    strategy_id: i64,
    user_id: String,
    instrument_id: String,
    exchange_id: String,
    cfg: ConditionOrderConfig,
    triggered: AtomicBool,
}

impl ConditionOrderRunner {
    pub fn from_strategy(strategy: &Strategy) -> Result<Self> {
        let cfg: ConditionOrderConfig = serde_json::from_value(strategy.config.clone())?;
        Ok(Self {
            strategy_id: strategy.id,
            user_id: strategy.user_id.clone(),
            instrument_id: strategy.instrument_id.clone(),
            exchange_id: strategy.exchange_id.clone(),
            cfg,
            triggered: AtomicBool::new(false),
        })
    }
}

impl StrategyRunner for ConditionOrderRunner {
    fn strategy_id(&self) -> i64 {
        self.strategy_id
    }

    fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    fn on_tick(&self, price: f64) -> Option<Order> {
        if self.triggered.load(Ordering::Relaxed) {
            return None;
        }
        if !self.cfg.operator.matches(price, self.cfg.trigger_price) {
            return None;
        }
        if self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        info!(
            "strategy {} triggered: price {} vs trigger {}",
            self.strategy_id, price, self.cfg.trigger_price
        );

        let (direction, offset) = self.cfg.action.direction_offset();
        // order_ref stays empty; the trading service derives the fresh
        // unique ref at placement.
        Some(Order {
            user_id: self.user_id.clone(),
            instrument_id: self.instrument_id.clone(),
            exchange_id: self.exchange_id.clone(),
            direction,
            comb_offset_flag: offset,
            limit_price: price,
            volume_total_original: self.cfg.volume,
            order_status: OrderStatus::Pending,
            strategy_id: Some(self.strategy_id),
            ..Default::default()
        })
    }
}

/// Instrument-indexed collection of live runners.
pub struct StrategyEngine {
    store: Arc<dyn Store>,
    runners: RwLock<HashMap<String, Vec<Arc<dyn StrategyRunner>>>>,
}

impl StrategyEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the index with fresh runners for every active strategy.
    ///
    /// Unknown types and unparsable configs are skipped with a warning
    /// so one bad row can't take trading down.
    pub async fn load_active(&self) -> Result<()> {
        let strategies = self.store.active_strategies().await?;

        let mut index: HashMap<String, Vec<Arc<dyn StrategyRunner>>> = HashMap::new();
        let mut count = 0usize;

        for strategy in &strategies {
            let runner: Arc<dyn StrategyRunner> = match strategy.strategy_type {
                StrategyType::ConditionOrder => match ConditionOrderRunner::from_strategy(strategy)
                {
                    Ok(runner) => Arc::new(runner),
                    Err(e) => {
                        warn!("failed to init strategy {}: {}", strategy.id, e);
                        continue;
                    }
                },
                other => {
                    warn!("unknown strategy type {:?}, skipping {}", other, strategy.id);
                    continue;
                }
            };
            index
                .entry(strategy.instrument_id.clone())
                .or_default()
                .push(runner);
            count += 1;
        }

        *self.runners.write().unwrap() = index;
        info!("loaded {} active strategies", count);
        Ok(())
    }

    /// Re-fetch after any strategy create/stop/start/update/delete so
    /// the change takes effect without a process restart.
    pub async fn reload(&self) -> Result<()> {
        info!("reloading strategies");
        self.load_active().await
    }

    /// Evaluate every runner watching this instrument. The read lock
    /// is not held across runner evaluation.
    pub fn on_tick(&self, instrument_id: &str, price: f64) -> Vec<Order> {
        let runners: Vec<Arc<dyn StrategyRunner>> = {
            let index = self.runners.read().unwrap();
            match index.get(instrument_id) {
                Some(list) => list.clone(),
                None => return Vec::new(),
            }
        };

        runners
            .iter()
            .filter_map(|runner| runner.on_tick(price))
            .collect()
    }

    /// Instruments any loaded strategy depends on.
    pub fn active_symbols(&self) -> Vec<String> {
        self.runners.read().unwrap().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn insert_runner(&self, instrument_id: &str, runner: Arc<dyn StrategyRunner>) {
        self.runners
            .write()
            .unwrap()
            .entry(instrument_id.to_string())
            .or_default()
            .push(runner);
    }
}
