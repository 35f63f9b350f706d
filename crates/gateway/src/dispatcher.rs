//! Market data dispatcher: the single loop behind the fan-out channel.
//!
//! Every inbound topic message passes through here exactly once. Ticks
//! are broadcast to the hub and offered to the strategy engine; query
//! replies are handed to the trade response processor. A fault in the
//! strategy hook is contained so the tick stream keeps flowing.

use crate::hub::Notifier;
use crate::processor::TradeResponseProcessor;
use crate::strategy::StrategyEngine;
use crate::trading::TradingService;
use common::envelope::{MarketMessage, TradeResponse};
use common::model::Order;
use metrics::counter;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// The tick fields the dispatcher itself cares about; the rest of the
/// payload stays opaque.
#[derive(Deserialize)]
struct TickPrice {
    #[serde(rename = "LastPrice")]
    last_price: f64,
}

pub struct MarketDispatcher {
    notifier: Arc<dyn Notifier>,
    strategies: Arc<StrategyEngine>,
    trading: Arc<TradingService>,
    processor: Arc<TradeResponseProcessor>,
}

impl MarketDispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        strategies: Arc<StrategyEngine>,
        trading: Arc<TradingService>,
        processor: Arc<TradeResponseProcessor>,
    ) -> Self {
        Self {
            notifier,
            strategies,
            trading,
            processor,
        }
    }

    /// Drain the fan-out channel until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<MarketMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("market dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        warn!("fan-out channel closed");
                        break;
                    };
                    self.dispatch(msg).await;
                }
            }
        }
        info!("market dispatcher stopped");
    }

    /// Route one message.
    pub async fn dispatch(&self, msg: MarketMessage) {
        if msg.is_query_reply() {
            match serde_json::from_str::<TradeResponse>(&msg.payload) {
                Ok(resp) => self.processor.process(resp).await,
                Err(e) => {
                    warn!("dropping malformed query reply: {}", e);
                    counter!("dispatcher_invalid_replies_total").increment(1);
                }
            }
            return;
        }

        // UI fan-out comes first and happens regardless of whether the
        // tick is usable for strategies.
        self.notifier.broadcast_market(&msg.symbol, &msg.payload);
        counter!("dispatcher_ticks_total").increment(1);

        let price = match serde_json::from_str::<TickPrice>(&msg.payload) {
            Ok(tick) => tick.last_price,
            Err(_) => {
                debug!("tick for {} without LastPrice, skipping strategies", msg.symbol);
                return;
            }
        };

        for order in self.evaluate_strategies(&msg.symbol, price) {
            if let Err(e) = self.trading.place_order(order).await {
                warn!("failed to place strategy order for {}: {}", msg.symbol, e);
            }
        }
    }

    /// Run the strategy hook behind a panic guard so a broken runner
    /// cannot stop the dispatch loop.
    fn evaluate_strategies(&self, symbol: &str, price: f64) -> Vec<Order> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.strategies.on_tick(symbol, price)
        })) {
            Ok(orders) => orders,
            Err(_) => {
                error!("panic in strategy hook for {}", symbol);
                counter!("dispatcher_strategy_panics_total").increment(1);
                Vec::new()
            }
        }
    }
}
