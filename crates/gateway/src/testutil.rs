//! Shared fakes for the crate's test modules.

use crate::ctp::CtpCommander;
use crate::error::{GatewayError, Result};
use crate::hub::Notifier;
use async_trait::async_trait;
use common::envelope::TradeResponse;
use common::model::Order;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Records upstream CTP calls; optionally fails subscribes or inserts.
#[derive(Default)]
pub struct RecordingCtp {
    pub calls: Mutex<Vec<String>>,
    pub orders: Mutex<Vec<Order>>,
    pub fail_subscribe: AtomicBool,
    pub fail_insert: AtomicBool,
}

#[async_trait]
impl CtpCommander for RecordingCtp {
    async fn subscribe(&self, instrument_id: &str) -> Result<()> {
        if self.fail_subscribe.load(Ordering::Relaxed) {
            return Err(GatewayError::Dispatch("bus down".into()));
        }
        self.calls.lock().unwrap().push(format!("sub:{}", instrument_id));
        Ok(())
    }

    async fn unsubscribe(&self, instrument_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("unsub:{}", instrument_id));
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        if self.fail_insert.load(Ordering::Relaxed) {
            return Err(GatewayError::Dispatch("bus down".into()));
        }
        self.calls.lock().unwrap().push(format!("insert:{}", order.order_ref));
        self.orders.lock().unwrap().push(order.clone());
        Ok(())
    }

    async fn cancel_order(&self, order: &Order) -> Result<()> {
        self.calls.lock().unwrap().push(format!("cancel:{}", order.order_ref));
        self.orders.lock().unwrap().push(order.clone());
        Ok(())
    }

    async fn query_positions(&self, user_id: &str, _instrument_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("qpos:{}", user_id));
        Ok(())
    }

    async fn query_account(&self, user_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("qacc:{}", user_id));
        Ok(())
    }

    async fn sync_instruments(&self) -> Result<()> {
        self.calls.lock().unwrap().push("sync".to_string());
        Ok(())
    }
}

/// Captures broadcasts instead of pushing them to sockets.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<TradeResponse>>,
    pub market: Mutex<Vec<(String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn broadcast_all(&self, event: &TradeResponse) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn broadcast_market(&self, symbol: &str, payload: &str) {
        self.market
            .lock()
            .unwrap()
            .push((symbol.to_string(), payload.to_string()));
    }
}
