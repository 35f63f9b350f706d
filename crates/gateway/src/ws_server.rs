//! WebSocket server handler using Axum.

use crate::client::{ClientState, OUTBOUND_QUEUE_CAPACITY};
use crate::hub::Hub;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Socket writes slower than this tear the client down.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub hub: Arc<Hub>,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","clients":{},"subscriptions":{}}}"#,
        state.hub.client_count(),
        state.hub.subscription_count()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let client = Arc::new(ClientState::new(tx));
    let client_id = state.hub.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    info!("client {} connected", client_id);

    // Dedicated writer: the only task that touches the socket's send
    // half, so per-client ordering is the queue ordering. A write that
    // misses the deadline means the peer is gone.
    let writer_hub = state.hub.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(WRITE_DEADLINE, ws_tx.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("client {} write failed: {}", client_id, e);
                    break;
                }
                Err(_) => {
                    warn!("client {} write deadline exceeded", client_id);
                    break;
                }
            }
        }
        writer_hub.unregister(&client_id);
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg) {
                            warn!("error handling message from {}: {}", client_id, e);
                            client.enqueue_text(
                                serde_json::to_string(&ServerMessage::Error {
                                    message: e,
                                    code: "PROCESSING_ERROR".to_string(),
                                })
                                .unwrap_or_default(),
                            );
                        }
                    }
                    Some(Err(e)) => {
                        warn!("websocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if !client.enqueue_frame(Message::Ping(vec![].into())) {
                    break;
                }
            }
        }
    }

    state.hub.unregister(&client_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    info!("client {} disconnected", client_id);
}

/// Handle a single inbound WebSocket frame.
fn handle_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: Message,
) -> Result<(), String> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage =
                serde_json::from_str(&text).map_err(|e| e.to_string())?;
            handle_client_message(state, client, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage =
                serde_json::from_slice(&data).map_err(|e| e.to_string())?;
            handle_client_message(state, client, client_msg)
        }
        Message::Ping(data) => {
            client.update_ping();
            client.enqueue_frame(Message::Pong(data));
            Ok(())
        }
        Message::Pong(_) => {
            client.update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client control message.
fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<(), String> {
    match msg {
        ClientMessage::Subscribe { instruments } => {
            debug!("client {} subscribing to {:?}", client.id, instruments);
            for instrument in &instruments {
                if instrument.is_empty() {
                    return Err("empty instrument id".to_string());
                }
                // Connection-level filter only; the system-level
                // upstream subscription set is managed elsewhere.
                state.hub.subscribe(&client.id, instrument);
            }
            reply(client, &ServerMessage::Subscribed { instruments });
            Ok(())
        }
        ClientMessage::Unsubscribe { instruments } => {
            debug!("client {} unsubscribing from {:?}", client.id, instruments);
            for instrument in &instruments {
                state.hub.unsubscribe(&client.id, instrument);
            }
            reply(client, &ServerMessage::Unsubscribed { instruments });
            Ok(())
        }
        ClientMessage::Ping => {
            client.update_ping();
            reply(client, &ServerMessage::Pong);
            Ok(())
        }
    }
}

fn reply(client: &Arc<ClientState>, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        client.enqueue_text(json);
    }
}
