//! WebSocket server handler using Axum.

use crate::client::{ClientRegistry, ClientState};
use crate::error::Result;
use crate::poll::handle_peek;
use crate::protocol::{strip_exchange_prefix, ClientRequest, ErrorFrame, SubscribeReply, WelcomeFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dispatcher::Dispatcher;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use quotes::QuoteHub;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use upstream::SessionPool;

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub hub: Arc<QuoteHub>,
    pub pool: Arc<SessionPool>,
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
        r#"{{"status":"ok","clients":{},"subscriptions":{},"upstream_sessions":{},"upstream_active":{}}}"#,
        state.registry.client_count(),
        state.dispatcher.total_subscriptions(),
        state.pool.total(),
        state.pool.active()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Per-client single-flight writing: every frame goes through this queue
    // and one task drains it, so sends never interleave.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    let client = Arc::new(ClientState::new(tx));
    let client_id = state.registry.register(client.clone());

    counter!("md_connections_total").increment(1);
    gauge!("md_active_clients").set(state.registry.client_count() as f64);

    info!(client = %client_id, "client connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Welcome frame goes out before anything else.
    let welcome = WelcomeFrame::new(client_id.to_string(), state.pool.active() > 0);
    if let Err(err) = client.send_json(&welcome) {
        warn!(client = %client_id, %err, "failed to queue welcome frame");
    }

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => handle_text(&state, &client, &text),
            Ok(Message::Ping(payload)) => {
                let _ = client.tx.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                let _ = client.send_json(&ErrorFrame::new("binary frames not supported"));
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(client = %client_id, %err, "websocket error");
                break;
            }
        }
    }

    // Disconnect: drop all dispatcher interest, then the registry entry and
    // with it the per-client diff baselines and suspend flag.
    state.dispatcher.remove_all_for_client(client_id);
    state.registry.unregister(&client_id);
    send_task.abort();

    counter!("md_disconnections_total").increment(1);
    gauge!("md_active_clients").set(state.registry.client_count() as f64);

    info!(client = %client_id, "client disconnected");
}

/// Parse and dispatch one text frame. Malformed JSON or an unknown `aid`
/// answers with an error frame; the channel stays open.
fn handle_text(state: &Arc<AppState>, client: &Arc<ClientState>, text: &str) {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => {
            if let Err(err) = handle_request(state, client, request) {
                warn!(client = %client.id, %err, "error handling request");
                let _ = client.send_json(&ErrorFrame::new(format!("error processing message: {err}")));
            }
        }
        Err(err) => {
            debug!(client = %client.id, %err, "rejecting malformed request");
            let _ = client.send_json(&ErrorFrame::new(format!("invalid request: {err}")));
        }
    }
}

/// Handle a parsed client request.
pub fn handle_request(
    state: &AppState,
    client: &Arc<ClientState>,
    request: ClientRequest,
) -> Result<()> {
    match request {
        ClientRequest::SubscribeQuote { ins_list } => {
            let mut added = 0usize;
            for item in ins_list.split(',') {
                let display_id = item.trim();
                if display_id.is_empty() {
                    continue;
                }
                let raw_id = strip_exchange_prefix(display_id);
                if raw_id.is_empty() {
                    continue;
                }

                state.hub.map_display(raw_id, display_id);
                client.add_subscription(raw_id);
                state.registry.index_instrument(raw_id, client.id);
                state.dispatcher.add_subscription(client.id, raw_id);
                added += 1;
            }
            debug!(client = %client.id, added, "subscribe_quote handled");
            counter!("md_subscriptions_total").increment(added as u64);

            // The protocol acks ok regardless of upstream placement; retries
            // and failover land the subscription eventually.
            client.send_json(&SubscribeReply::ok())
        }
        ClientRequest::PeekMessage => {
            handle_peek(state, client);
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::app_state;
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(state: &AppState) -> (Arc<ClientState>, UnboundedReceiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Arc::new(ClientState::new(tx));
        state.registry.register(client.clone());
        (client, rx)
    }

    fn next_json(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn subscribe_quote_strips_prefixes_and_acks_ok() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);

        handle_request(
            &state,
            &client,
            ClientRequest::SubscribeQuote {
                ins_list: "SHFE.rb2410,DCE.m2409,,rb2411".into(),
            },
        )
        .unwrap();

        let reply = next_json(&mut rx);
        assert_eq!(reply["aid"], "subscribe_quote");
        assert_eq!(reply["status"], "ok");

        assert!(client.is_subscribed("rb2410"));
        assert!(client.is_subscribed("m2409"));
        assert!(client.is_subscribed("rb2411"));
        assert_eq!(client.subscription_count(), 3);

        // Raw→display mapping recorded for the prefixed forms.
        assert_eq!(state.hub.display_of("rb2410"), "SHFE.rb2410");
        assert_eq!(state.hub.display_of("m2409"), "DCE.m2409");
        assert_eq!(state.hub.display_of("rb2411"), "rb2411");

        // Dispatcher saw the interest even with no session available.
        assert_eq!(state.dispatcher.subscriptions_for_client(client.id).len(), 3);
    }

    #[test]
    fn shared_instrument_is_requested_once_per_client() {
        let (state, _wake_rx) = app_state();
        let (a, mut a_rx) = connect(&state);
        let (b, mut b_rx) = connect(&state);

        handle_request(
            &state,
            &a,
            ClientRequest::SubscribeQuote {
                ins_list: "EX.x".into(),
            },
        )
        .unwrap();
        handle_request(
            &state,
            &b,
            ClientRequest::SubscribeQuote {
                ins_list: "EX.x,EX.y".into(),
            },
        )
        .unwrap();
        next_json(&mut a_rx);
        next_json(&mut b_rx);

        let mut x_clients = state.dispatcher.clients_for_instrument("x");
        x_clients.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(x_clients, expected);
        assert_eq!(state.dispatcher.clients_for_instrument("y"), [b.id]);
    }

    #[test]
    fn disconnect_cleanup_removes_dispatcher_interest() {
        let (state, _wake_rx) = app_state();
        let (client, _rx) = connect(&state);
        handle_request(
            &state,
            &client,
            ClientRequest::SubscribeQuote {
                ins_list: "EX.x,EX.y".into(),
            },
        )
        .unwrap();

        state.dispatcher.remove_all_for_client(client.id);
        state.registry.unregister(&client.id);

        assert!(state.dispatcher.subscriptions_for_client(client.id).is_empty());
        assert!(state.dispatcher.clients_for_instrument("x").is_empty());
        assert_eq!(state.registry.client_count(), 0);
    }
}
