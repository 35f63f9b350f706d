//! Lifecycle coordinator: constructs the wiring, starts the background
//! loops, and owns the one shutdown flag they all watch.

use crate::ctp::{CtpClient, CtpCommander};
use crate::dispatcher::MarketDispatcher;
use crate::error::Result;
use crate::hub::Hub;
use crate::market::MarketService;
use crate::processor::TradeResponseProcessor;
use crate::store::Store;
use crate::strategy::StrategyEngine;
use crate::subscriptions::SubscriptionService;
use crate::trading::TradingService;
use common::envelope::MarketMessage;
use redis_bus::RedisBus;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Capacity of the internal tick/reply fan-out channel.
const FANOUT_CAPACITY: usize = 10_000;

pub struct Engine {
    bus: RedisBus,
    hub: Arc<Hub>,
    market: Arc<MarketService>,
    strategies: Arc<StrategyEngine>,
    trading: Arc<TradingService>,
    processor: Arc<TradeResponseProcessor>,
    subscriptions: Arc<SubscriptionService>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire the engine against the real CTP command encoder.
    pub fn new(bus: RedisBus, store: Arc<dyn Store>) -> Self {
        let ctp: Arc<dyn CtpCommander> = Arc::new(CtpClient::new(bus.clone()));
        Self::with_commander(bus, store, ctp)
    }

    /// Wire the engine with an explicit commander (tests swap in a
    /// recording fake here).
    pub fn with_commander(
        bus: RedisBus,
        store: Arc<dyn Store>,
        ctp: Arc<dyn CtpCommander>,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let market = Arc::new(MarketService::new(ctp.clone()));
        let strategies = Arc::new(StrategyEngine::new(store.clone()));
        let trading = Arc::new(TradingService::new(store.clone(), ctp));
        let processor = Arc::new(TradeResponseProcessor::new(store.clone(), hub.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(store, market.clone()));

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bus,
            hub,
            market,
            strategies,
            trading,
            processor,
            subscriptions,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn market(&self) -> Arc<MarketService> {
        self.market.clone()
    }

    pub fn strategies(&self) -> Arc<StrategyEngine> {
        self.strategies.clone()
    }

    pub fn trading(&self) -> Arc<TradingService> {
        self.trading.clone()
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionService> {
        self.subscriptions.clone()
    }

    /// Load persisted state and issue the startup subscriptions.
    ///
    /// Persisted subscriptions are restored first so each gets exactly
    /// one upstream SUBSCRIBE; strategy instruments then only add a
    /// reference unless no persisted record covered them.
    pub async fn bootstrap(&self) -> Result<()> {
        self.strategies.load_active().await?;

        if let Err(e) = self.subscriptions.restore().await {
            warn!("failed to restore subscriptions: {}", e);
        }

        for instrument_id in self.strategies.active_symbols() {
            info!("subscribing {} for active strategies", instrument_id);
            if let Err(e) = self.market.subscribe(&instrument_id).await {
                warn!("failed to subscribe {} for strategies: {}", instrument_id, e);
            }
        }

        Ok(())
    }

    /// Bootstrap and launch every background loop.
    pub async fn start(&self) -> Result<()> {
        info!("starting engine");
        self.bootstrap().await?;

        let (fanout_tx, fanout_rx) = mpsc::channel::<MarketMessage>(FANOUT_CAPACITY);
        let mut tasks = self.tasks.lock().unwrap();

        // Bus subscribers feeding the fan-out channel.
        {
            let bus = self.bus.clone();
            let tx = fanout_tx.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = bus.run_market_feed(tx, shutdown).await {
                    error!("market feed failed: {}", e);
                }
            }));
        }
        {
            let bus = self.bus.clone();
            let tx = fanout_tx;
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = bus.run_query_feed(tx, shutdown).await {
                    error!("query feed failed: {}", e);
                }
            }));
        }

        // Core status watcher: a reconnect wipes the core's
        // subscription table, so re-issue everything active.
        {
            let (status_tx, mut status_rx) = mpsc::channel::<()>(8);
            let bus = self.bus.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = bus.run_status_feed(status_tx, shutdown).await {
                    error!("status feed failed: {}", e);
                }
            }));

            let market = self.market.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        event = status_rx.recv() => {
                            if event.is_none() {
                                break;
                            }
                            if let Err(e) = market.resubscribe_all().await {
                                warn!("resubscribe after core restart failed: {}", e);
                            }
                        }
                    }
                }
            }));
        }

        // Dispatcher and trade response consumer.
        {
            let dispatcher = Arc::new(MarketDispatcher::new(
                self.hub.clone(),
                self.strategies.clone(),
                self.trading.clone(),
                self.processor.clone(),
            ));
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(dispatcher.run(fanout_rx, shutdown)));
        }
        {
            let processor = self.processor.clone();
            let bus = self.bus.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(processor.run(bus, shutdown)));
        }

        info!("engine started");
        Ok(())
    }

    /// Flip the shutdown flag and wait for every loop to drain its
    /// current message and exit.
    pub async fn stop(&self) {
        info!("stopping engine");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::RecordingCtp;
    use common::model::{Strategy, StrategyStatus, StrategyType, Subscription};
    use serde_json::json;

    fn engine_with(
        store: Arc<MemoryStore>,
        ctp: Arc<RecordingCtp>,
    ) -> Engine {
        let bus = RedisBus::new("redis://127.0.0.1:6379").unwrap();
        Engine::with_commander(bus, store, ctp)
    }

    #[tokio::test]
    async fn test_bootstrap_restores_and_covers_strategy_symbols() {
        let store = Arc::new(MemoryStore::new());
        store.put_subscription(Subscription {
            instrument_id: "rb2505".to_string(),
            ..Default::default()
        });
        store.put_strategy(Strategy {
            id: 1,
            instrument_id: "rb2505".to_string(),
            strategy_type: StrategyType::ConditionOrder,
            status: StrategyStatus::Active,
            config: json!({"TriggerPrice": 3000.0, "Operator": ">=", "Action": "open_long", "Volume": 1}),
            ..Default::default()
        });
        store.put_strategy(Strategy {
            id: 2,
            instrument_id: "au2507".to_string(),
            strategy_type: StrategyType::ConditionOrder,
            status: StrategyStatus::Active,
            config: json!({"TriggerPrice": 500.0, "Operator": "<", "Action": "open_short", "Volume": 1}),
            ..Default::default()
        });

        let ctp = Arc::new(RecordingCtp::default());
        let engine = engine_with(store, ctp.clone());
        engine.bootstrap().await.unwrap();

        let mut calls = ctp.calls.lock().unwrap().clone();
        calls.sort();
        // rb2505 came from the persisted table; the strategy on it only
        // added a reference. au2507 had no record, so the strategy
        // triggered its first subscribe.
        assert_eq!(calls, vec!["sub:au2507", "sub:rb2505"]);

        let mut active = engine.market().active_symbols();
        active.sort();
        assert_eq!(active, vec!["au2507", "rb2505"]);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_clean() {
        let engine = engine_with(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingCtp::default()),
        );
        engine.stop().await;
    }
}
