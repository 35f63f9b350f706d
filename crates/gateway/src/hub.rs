//! WebSocket hub: client registry and broadcast fan-out.
//!
//! Market ticks go only to clients subscribed to the instrument; order
//! and trade events go to every connection (the deployment is a single
//! trading account, so per-user push degenerates to a broadcast).
//!
//! Broadcasts never block: each client has a bounded queue drained by
//! its own writer task, and a full queue drops the message for that
//! client only.

use crate::client::{ClientId, ClientState};
use common::envelope::TradeResponse;
use dashmap::{DashMap, DashSet};
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{info, warn};

/// Push capability handed to the dispatcher and the trade-response
/// processor.
pub trait Notifier: Send + Sync {
    /// Broadcast an order/trade/error event to every client.
    fn broadcast_all(&self, event: &TradeResponse);
    /// Broadcast a raw tick payload to the instrument's subscribers.
    fn broadcast_market(&self, symbol: &str, payload: &str);
}

/// Registry of connected clients with a per-instrument reverse index.
///
/// Invariant: a client is in `clients` iff its writer task is alive;
/// `unregister` removes it from every index in one pass.
#[derive(Default)]
pub struct Hub {
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// instrument -> subscribed client ids.
    subscriptions: DashMap<String, DashSet<ClientId>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a client. Its writer task must already be running.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        gauge!("gateway_active_connections").set(self.clients.len() as f64);
        info!("client {} registered", id);
        id
    }

    /// Remove a client from every index and close its outbound queue.
    pub fn unregister(&self, client_id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            for instrument in client.subscriptions.iter() {
                if let Some(subscribers) = self.subscriptions.get(&*instrument) {
                    subscribers.remove(client_id);
                }
            }
            gauge!("gateway_active_connections").set(self.clients.len() as f64);
            info!("client {} unregistered", client_id);
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|c| c.clone())
    }

    /// Add a connection-level tick filter. This never touches the
    /// upstream subscription set.
    pub fn subscribe(&self, client_id: &ClientId, instrument_id: &str) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        client.subscriptions.insert(instrument_id.to_string());
        self.subscriptions
            .entry(instrument_id.to_string())
            .or_default()
            .insert(*client_id);
    }

    /// Remove a connection-level tick filter.
    pub fn unsubscribe(&self, client_id: &ClientId, instrument_id: &str) {
        if let Some(client) = self.clients.get(client_id) {
            client.subscriptions.remove(instrument_id);
        }
        if let Some(subscribers) = self.subscriptions.get(instrument_id) {
            subscribers.remove(client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Notifier for Hub {
    fn broadcast_all(&self, event: &TradeResponse) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!("failed to serialize broadcast event: {}", e);
                return;
            }
        };
        for client in self.clients.iter() {
            client.enqueue_text(json.clone());
        }
        counter!("gateway_events_broadcast_total").increment(1);
    }

    fn broadcast_market(&self, symbol: &str, payload: &str) {
        let Some(subscribers) = self.subscriptions.get(symbol) else {
            return;
        };
        for client_id in subscribers.iter() {
            if let Some(client) = self.clients.get(&*client_id) {
                // Raw payload bytes, exactly as received from the core.
                client.enqueue_text(payload.to_string());
            }
        }
        counter!("gateway_ticks_broadcast_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::envelope::ResponseType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connect(hub: &Hub, capacity: usize) -> (Arc<ClientState>, mpsc::Receiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let client = Arc::new(ClientState::new(tx));
        hub.register(client.clone());
        (client, rx)
    }

    fn text_of(msg: axum::extract::ws::Message) -> String {
        match msg {
            axum::extract::ws::Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_market_broadcast_respects_filters() {
        let hub = Hub::new();
        let (subscribed, mut rx1) = connect(&hub, 8);
        let (_other, mut rx2) = connect(&hub, 8);

        hub.subscribe(&subscribed.id, "rb2505");
        hub.broadcast_market("rb2505", r#"{"InstrumentID":"rb2505","LastPrice":3850.0}"#);

        let got = text_of(rx1.recv().await.unwrap());
        assert_eq!(got, r#"{"InstrumentID":"rb2505","LastPrice":3850.0}"#);
        // The unsubscribed client saw nothing.
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_all_reaches_every_client() {
        let hub = Hub::new();
        let (_c1, mut rx1) = connect(&hub, 8);
        let (_c2, mut rx2) = connect(&hub, 8);

        let event = TradeResponse {
            response_type: ResponseType::RtnOrder,
            request_id: "O1".to_string(),
            payload: json!({"OrderStatus": "3"}),
        };
        hub.broadcast_all(&event);

        assert!(text_of(rx1.recv().await.unwrap()).contains("RTN_ORDER"));
        assert!(text_of(rx2.recv().await.unwrap()).contains("RTN_ORDER"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_client() {
        let hub = Hub::new();
        let (slow, mut slow_rx) = connect(&hub, 1);
        let (fast, mut fast_rx) = connect(&hub, 8);
        hub.subscribe(&slow.id, "rb2505");
        hub.subscribe(&fast.id, "rb2505");

        hub.broadcast_market("rb2505", "t1");
        hub.broadcast_market("rb2505", "t2");
        hub.broadcast_market("rb2505", "t3");

        // The slow client got exactly its queue capacity.
        assert_eq!(text_of(slow_rx.recv().await.unwrap()), "t1");
        assert!(slow_rx.try_recv().is_err());

        // The fast client got everything, in order.
        assert_eq!(text_of(fast_rx.recv().await.unwrap()), "t1");
        assert_eq!(text_of(fast_rx.recv().await.unwrap()), "t2");
        assert_eq!(text_of(fast_rx.recv().await.unwrap()), "t3");
    }

    #[tokio::test]
    async fn test_unregister_clears_every_index() {
        let hub = Hub::new();
        let (client, _rx) = connect(&hub, 8);
        hub.subscribe(&client.id, "rb2505");
        hub.subscribe(&client.id, "ag2506");
        assert_eq!(hub.client_count(), 1);

        hub.unregister(&client.id);
        assert_eq!(hub.client_count(), 0);
        for entry in hub.subscriptions.iter() {
            assert!(entry.value().is_empty());
        }
    }

    #[tokio::test]
    async fn test_tick_ordering_per_client() {
        let hub = Hub::new();
        let (client, mut rx) = connect(&hub, 64);
        hub.subscribe(&client.id, "rb2505");

        for i in 0..10 {
            hub.broadcast_market("rb2505", &format!("tick-{}", i));
        }
        for i in 0..10 {
            assert_eq!(text_of(rx.recv().await.unwrap()), format!("tick-{}", i));
        }
    }
}
