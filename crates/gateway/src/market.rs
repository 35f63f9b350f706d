//! Reference-counted market-data subscriptions.
//!
//! The registry tracks how many interested parties (persisted
//! subscriptions, strategies) want each instrument. The upstream
//! SUBSCRIBE goes out only on the 0→1 transition and the UNSUBSCRIBE
//! only on 1→0, so the CTP core sees one logical subscription per
//! instrument regardless of fan-in.

use crate::ctp::CtpCommander;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

/// In-memory per-instrument reference counter. All operations take the
/// one lock; none of them block on I/O.
#[derive(Default)]
pub struct SubscriptionRegistry {
    counters: Mutex<HashMap<String, u32>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter; true iff this was the 0→1 transition.
    pub fn add_ref(&self, instrument_id: &str) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(instrument_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrement the counter, clamping at zero; true iff this was the
    /// 1→0 transition (the entry is removed).
    pub fn release_ref(&self, instrument_id: &str) -> bool {
        let mut counters = self.counters.lock().unwrap();
        match counters.get_mut(instrument_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    counters.remove(instrument_id);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Re-seat one persisted record at restore time. Exactly one
    /// increment per call.
    pub fn restore(&self, instrument_id: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(instrument_id.to_string()).or_insert(0) += 1;
    }

    /// Instruments with a live upstream subscription.
    pub fn active_symbols(&self) -> Vec<String> {
        self.counters.lock().unwrap().keys().cloned().collect()
    }

    #[cfg(test)]
    fn count(&self, instrument_id: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(instrument_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Market-data service: the registry plus the upstream side effects.
pub struct MarketService {
    registry: SubscriptionRegistry,
    ctp: Arc<dyn CtpCommander>,
}

impl MarketService {
    pub fn new(ctp: Arc<dyn CtpCommander>) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            ctp,
        }
    }

    /// Add one reference; issue the upstream SUBSCRIBE on first use.
    /// A failed bus write rolls the reference back.
    pub async fn subscribe(&self, instrument_id: &str) -> Result<()> {
        let first = self.registry.add_ref(instrument_id);
        if first {
            info!("first subscription for {}, subscribing upstream", instrument_id);
            if let Err(e) = self.ctp.subscribe(instrument_id).await {
                self.registry.release_ref(instrument_id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop one reference; issue the upstream UNSUBSCRIBE when the
    /// last interested party leaves.
    pub async fn unsubscribe(&self, instrument_id: &str) -> Result<()> {
        if self.registry.release_ref(instrument_id) {
            info!("no subscribers left for {}, unsubscribing upstream", instrument_id);
            self.ctp.unsubscribe(instrument_id).await?;
        }
        Ok(())
    }

    /// Re-seat the counter from one persisted record and re-issue its
    /// upstream SUBSCRIBE; used only during startup restore. Exactly
    /// one increment per call.
    pub async fn restore_subscription(&self, instrument_id: &str) -> Result<()> {
        self.registry.restore(instrument_id);
        self.ctp.subscribe(instrument_id).await
    }

    /// Re-issue SUBSCRIBE for every active instrument after the core
    /// restarts. Individual failures don't stop the sweep.
    pub async fn resubscribe_all(&self) -> Result<()> {
        let symbols = self.registry.active_symbols();
        info!("resubscribing {} instruments", symbols.len());
        for instrument_id in symbols {
            if let Err(e) = self.ctp.subscribe(&instrument_id).await {
                warn!("failed to resubscribe {}: {}", instrument_id, e);
            }
        }
        Ok(())
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.registry.active_symbols()
    }

    /// Trigger a full instrument sync on the core.
    pub async fn sync_instruments(&self) -> Result<()> {
        info!("triggering instrument sync");
        self.ctp.sync_instruments().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingCtp;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_ref_counting_transitions() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.add_ref("ag2506"));
        assert!(!registry.add_ref("ag2506"));
        assert_eq!(registry.count("ag2506"), 2);

        assert!(!registry.release_ref("ag2506"));
        assert_eq!(registry.count("ag2506"), 1);
        assert!(registry.active_symbols().contains(&"ag2506".to_string()));

        assert!(registry.release_ref("ag2506"));
        assert_eq!(registry.count("ag2506"), 0);
        assert!(registry.active_symbols().is_empty());
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.release_ref("rb2505"));
        registry.add_ref("rb2505");
        assert!(registry.release_ref("rb2505"));
        assert!(!registry.release_ref("rb2505"));
    }

    #[test]
    fn test_restore_increments_exactly_once() {
        let registry = SubscriptionRegistry::new();
        registry.restore("rb2505");
        assert_eq!(registry.count("rb2505"), 1);
        registry.restore("rb2505");
        assert_eq!(registry.count("rb2505"), 2);
    }

    #[tokio::test]
    async fn test_upstream_only_on_edges() {
        let ctp = Arc::new(RecordingCtp::default());
        let market = MarketService::new(ctp.clone());

        market.subscribe("ag2506").await.unwrap();
        market.subscribe("ag2506").await.unwrap();
        market.unsubscribe("ag2506").await.unwrap();
        market.unsubscribe("ag2506").await.unwrap();

        let calls = ctp.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["sub:ag2506", "unsub:ag2506"]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back_ref() {
        let ctp = Arc::new(RecordingCtp::default());
        ctp.fail_subscribe
            .store(true, Ordering::Relaxed);
        let market = MarketService::new(ctp.clone());

        assert!(market.subscribe("rb2505").await.is_err());
        assert!(market.active_symbols().is_empty());

        // A later attempt is still the first reference.
        ctp.fail_subscribe
            .store(false, Ordering::Relaxed);
        market.subscribe("rb2505").await.unwrap();
        let calls = ctp.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["sub:rb2505"]);
    }

    #[tokio::test]
    async fn test_resubscribe_all_covers_active_set_once() {
        let ctp = Arc::new(RecordingCtp::default());
        let market = MarketService::new(ctp.clone());

        market.subscribe("rb2505").await.unwrap();
        market.subscribe("ag2506").await.unwrap();
        market.subscribe("ag2506").await.unwrap();
        ctp.calls.lock().unwrap().clear();

        market.resubscribe_all().await.unwrap();

        let mut calls = ctp.calls.lock().unwrap().clone();
        calls.sort();
        // One fresh SUBSCRIBE per active instrument, no duplicates.
        assert_eq!(calls, vec!["sub:ag2506", "sub:rb2505"]);
    }
}
