//! Order entry: stamps refs, dispatches to the core, persists behind
//! the dispatch.
//!
//! The bus write comes first and the database write second, on a
//! background task: order latency beats order durability here, and the
//! authoritative record is rebuilt from RTN_ORDER either way.

use crate::ctp::CtpCommander;
use crate::error::{GatewayError, Result};
use crate::store::Store;
use chrono::Utc;
use common::model::{Order, OrderStatus, Position};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

pub struct TradingService {
    store: Arc<dyn Store>,
    ctp: Arc<dyn CtpCommander>,
    /// Last issued numeric order ref; enforces uniqueness when the
    /// clock alone can't (two placements in the same microsecond).
    last_ref: AtomicU64,
}

impl TradingService {
    pub fn new(store: Arc<dyn Store>, ctp: Arc<dyn CtpCommander>) -> Self {
        Self {
            store,
            ctp,
            last_ref: AtomicU64::new(0),
        }
    }

    /// Derive a fresh client-side order ref: six low digits of the
    /// epoch seconds followed by six digits of microseconds, bumped
    /// past the previous ref if the clock hasn't moved.
    fn derive_order_ref(&self) -> String {
        let now = Utc::now();
        let secs = (now.timestamp() % 1_000_000) as u64;
        let micros = now.timestamp_subsec_micros() as u64 % 1_000_000;
        let candidate = secs * 1_000_000 + micros;

        let mut prev = self.last_ref.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(prev + 1);
            match self.last_ref.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return format!("{:012}", next),
                Err(current) => prev = current,
            }
        }
    }

    /// Accept an order, dispatch it, and persist it asynchronously.
    ///
    /// A dispatch failure surfaces to the caller and nothing is
    /// persisted; a persistence failure is only logged, because the
    /// next RTN_ORDER carries enough to reconstruct the row.
    pub async fn place_order(&self, mut order: Order) -> Result<Order> {
        if order.order_ref.is_empty() {
            order.order_ref = self.derive_order_ref();
        }
        order.order_status = OrderStatus::Sent;
        order.created_at = Utc::now();

        self.ctp
            .insert_order(&order)
            .await
            .map_err(|e| GatewayError::Dispatch(e.to_string()))?;

        let store = self.store.clone();
        let record = order.clone();
        tokio::spawn(async move {
            if let Err(e) = store.create_order(record.clone()).await {
                error!("failed to persist order {}: {}", record.order_ref, e);
            }
        });

        info!("order {} sent to core", order.order_ref);
        Ok(order)
    }

    /// Request cancellation of a live order.
    pub async fn cancel_order(&self, order_id: i64) -> Result<()> {
        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("order not found".to_string()))?;

        if order.order_status.is_terminal() {
            return Err(GatewayError::OrderTerminal);
        }

        self.ctp.cancel_order(&order).await?;
        info!("cancel request sent for order {}", order.order_ref);
        Ok(())
    }

    /// Ask the core for fresh positions; the reply lands on the
    /// query topic later.
    pub async fn query_positions(&self, user_id: &str, instrument_id: &str) -> Result<()> {
        self.ctp.query_positions(user_id, instrument_id).await
    }

    /// Ask the core for the trading account snapshot.
    pub async fn query_account(&self, user_id: &str) -> Result<()> {
        self.ctp.query_account(user_id).await
    }

    pub async fn orders(&self, user_id: &str) -> Result<Vec<Order>> {
        self.store.list_orders(user_id).await
    }

    pub async fn positions(&self, user_id: &str) -> Result<Vec<Position>> {
        self.store.list_positions(user_id).await
    }
}
