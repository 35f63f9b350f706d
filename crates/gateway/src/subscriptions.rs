//! Persisted market-data subscriptions.
//!
//! This is the system-level subscription set (global to the trading
//! account): it drives the upstream SUBSCRIBE/UNSUBSCRIBE through the
//! market service and survives restarts. Connection-level WebSocket
//! filters live in the hub and never reach here.

use crate::error::{GatewayError, Result};
use crate::market::MarketService;
use crate::store::Store;
use common::model::Subscription;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SubscriptionService {
    store: Arc<dyn Store>,
    market: Arc<MarketService>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn Store>, market: Arc<MarketService>) -> Self {
        Self { store, market }
    }

    /// All persisted subscriptions in display order.
    pub async fn list(&self) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions().await
    }

    /// Persist a new subscription and bring the upstream feed up.
    ///
    /// The record is kept even if the upstream subscribe fails; the
    /// peer-restart recovery path re-issues it later.
    pub async fn add(&self, instrument_id: &str, exchange_id: &str) -> Result<Subscription> {
        let existing = self.store.list_subscriptions().await?;
        let sub = self
            .store
            .create_subscription(Subscription {
                instrument_id: instrument_id.to_string(),
                exchange_id: exchange_id.to_string(),
                sorter: existing.len() as i32,
                ..Default::default()
            })
            .await?;

        if let Err(e) = self.market.subscribe(instrument_id).await {
            warn!("failed to subscribe {} upstream: {}", instrument_id, e);
        }

        info!("subscription added for {}", instrument_id);
        Ok(sub)
    }

    /// Delete a subscription and release its upstream reference.
    pub async fn remove(&self, instrument_id: &str) -> Result<()> {
        if !self.store.delete_subscription(instrument_id).await? {
            return Err(GatewayError::NotFound("subscription not found".to_string()));
        }

        if let Err(e) = self.market.unsubscribe(instrument_id).await {
            warn!("failed to unsubscribe {} upstream: {}", instrument_id, e);
        }

        info!("subscription removed for {}", instrument_id);
        Ok(())
    }

    /// Rewrite display order to match the given sequence.
    pub async fn reorder(&self, instrument_ids: &[String]) -> Result<()> {
        self.store.reorder_subscriptions(instrument_ids).await
    }

    /// Re-seat the registry from persistence and re-issue the upstream
    /// subscribes. Called once at startup, before anything else takes
    /// references.
    pub async fn restore(&self) -> Result<()> {
        let subs = self.store.list_subscriptions().await?;
        if subs.is_empty() {
            return Ok(());
        }
        info!("restoring {} subscriptions", subs.len());
        for sub in &subs {
            if let Err(e) = self.market.restore_subscription(&sub.instrument_id).await {
                warn!("failed to restore subscription {}: {}", sub.instrument_id, e);
            }
        }
        Ok(())
    }
}
