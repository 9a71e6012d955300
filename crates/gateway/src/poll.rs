//! Poll-driven differential push.
//!
//! A `peek_message` collects every subscribed instrument whose cache version
//! advanced past what the client last saw, then answers with a full frame
//! (first delivery) or a field-level diff frame. A peek that finds nothing
//! suspends the client; the wake pump re-runs the peek when a relevant cache
//! write lands.

use crate::client::ClientState;
use crate::ws_server::AppState;
use metrics::counter;
use quotes::json::{quote_diff, quote_to_json};
use quotes::QuoteRecord;
use serde_json::{json, Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// Clients woken per notification before yielding the reactor.
const WAKE_BATCH: usize = 32;

/// One instrument's update collected for a client.
struct Update {
    raw_id: String,
    record: QuoteRecord,
    version: u64,
}

/// Serve one `peek_message` for `client`.
pub fn handle_peek(state: &AppState, client: &Arc<ClientState>) {
    // An explicit poll supersedes any previous suspension.
    client.suspended.store(false, Ordering::Release);

    let (subscriptions, last_versions, last_sent) = {
        let quotes = common::lock(&client.quotes);
        (
            quotes.subscriptions.iter().cloned().collect::<Vec<_>>(),
            quotes.last_versions.clone(),
            quotes.last_sent.clone(),
        )
    };
    if subscriptions.is_empty() {
        return;
    }
    let has_prior = !last_sent.is_empty();

    // Collect instruments whose cache version moved past the client's view.
    let cache = state.hub.cache();
    let mut updates = Vec::new();
    for raw_id in subscriptions {
        let Some(index) = cache.index_of(&raw_id) else {
            continue;
        };
        // A bounded read that loses the race simply skips this cycle.
        let Some((record, version)) = cache.load(index) else {
            continue;
        };
        if let Some(&seen) = last_versions.get(&raw_id) {
            if version <= seen {
                continue;
            }
        }
        updates.push(Update {
            raw_id,
            record,
            version,
        });
    }

    if updates.is_empty() {
        // Nothing new. A client that has received data before parks until
        // the next relevant write; one that never has gets no frame at all.
        if has_prior {
            client.suspended.store(true, Ordering::Release);
        }
        return;
    }

    let frame = if has_prior {
        diff_frame(state, &updates, &last_sent)
    } else {
        Some(full_frame(state, &updates))
    };

    match frame {
        Some(text) => {
            if client.send_text(text).is_err() {
                debug!(client = %client.id, "send queue closed during peek");
                return;
            }
            counter!("md_frames_sent_total").increment(1);
        }
        None => {
            // Every diff came out empty (version moved, values identical).
            // Re-suspend instead of sending an empty frame.
            client.suspended.store(true, Ordering::Release);
        }
    }

    // Advance the client's view in both cases so the same versions are not
    // re-examined on the next cycle.
    let mut quotes = common::lock(&client.quotes);
    for update in updates {
        if !quotes.subscriptions.contains(&update.raw_id) {
            // Unsubscribed while we were collecting; do not resurrect it.
            continue;
        }
        quotes.last_sent.insert(update.raw_id.clone(), update.record);
        quotes.last_versions.insert(update.raw_id, update.version);
    }
}

/// `rtn_data` envelope around a quotes object.
fn rtn_data(quotes: Map<String, Value>) -> String {
    json!({
        "aid": "rtn_data",
        "data": [
            { "quotes": quotes },
            { "account_id": "", "ins_list": "", "mdhis_more_data": false }
        ]
    })
    .to_string()
}

/// First delivery: all fields of every updated instrument.
fn full_frame(state: &AppState, updates: &[Update]) -> String {
    let mut quotes = Map::new();
    for update in updates {
        quotes.insert(
            state.hub.display_of(&update.raw_id),
            quote_to_json(&update.record),
        );
    }
    rtn_data(quotes)
}

/// Subsequent deliveries: changed fields only; instruments with no prior
/// baseline are sent in full. `None` when nothing actually differs.
fn diff_frame(
    state: &AppState,
    updates: &[Update],
    last_sent: &std::collections::HashMap<String, QuoteRecord>,
) -> Option<String> {
    let mut quotes = Map::new();
    for update in updates {
        match last_sent.get(&update.raw_id) {
            Some(old) => {
                let diff = quote_diff(old, &update.record);
                if !diff.is_empty() {
                    quotes.insert(state.hub.display_of(&update.raw_id), Value::Object(diff));
                }
            }
            None => {
                quotes.insert(
                    state.hub.display_of(&update.raw_id),
                    quote_to_json(&update.record),
                );
            }
        }
    }
    if quotes.is_empty() {
        None
    } else {
        Some(rtn_data(quotes))
    }
}

/// Consume the hub's wake channel: for every written instrument, re-run the
/// peek of each suspended subscriber, in bounded batches so one hot
/// instrument cannot monopolize the reactor.
pub async fn run_wake_pump(state: Arc<AppState>, mut wake_rx: UnboundedReceiver<String>) {
    while let Some(raw_id) = wake_rx.recv().await {
        let claimed = state.registry.claim_suspended(&raw_id);
        if claimed.is_empty() {
            continue;
        }
        counter!("md_wakeups_total").increment(claimed.len() as u64);
        for batch in claimed.chunks(WAKE_BATCH) {
            for client in batch {
                debug!(client = %client.id, raw_id = %raw_id, "waking suspended client");
                handle_peek(&state, client);
            }
            tokio::task::yield_now().await;
        }
    }
    warn!("wake channel closed, pump exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws_server::testing::app_state;
    use axum::extract::ws::Message;
    use quotes::DepthTick;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(state: &AppState) -> (Arc<ClientState>, UnboundedReceiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Arc::new(ClientState::new(tx));
        state.registry.register(client.clone());
        (client, rx)
    }

    fn subscribe(state: &AppState, client: &Arc<ClientState>, display_id: &str) {
        let raw_id = crate::protocol::strip_exchange_prefix(display_id);
        state.hub.map_display(raw_id, display_id);
        client.add_subscription(raw_id);
        state.registry.index_instrument(raw_id, client.id);
    }

    fn tick(raw_id: &str, last_price: f64, bid1: f64, bid1_volume: i32) -> DepthTick {
        DepthTick {
            instrument_id: raw_id.into(),
            trading_day: "20260802".into(),
            update_time: "10:00:00".into(),
            update_millisec: 0,
            last_price,
            bid_price: [bid1, 0.0, 0.0, 0.0, 0.0],
            bid_volume: [bid1_volume, 0, 0, 0, 0],
            ..Default::default()
        }
    }

    fn next_frame(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn first_peek_sends_full_frame_second_sends_diff() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");

        state.hub.publish(&tick("x", 10.0, 9.99, 5));
        handle_peek(&state, &client);

        let frame = next_frame(&mut rx);
        assert_eq!(frame["aid"], "rtn_data");
        let quote = &frame["data"][0]["quotes"]["EX.x"];
        // Full schema on first delivery.
        assert_eq!(quote["last_price"], 10.0);
        assert_eq!(quote["bid_price1"], 9.99);
        assert_eq!(quote["bid_volume1"], 5);
        assert!(quote["ask_price6"].is_null());
        assert!(quote["average"].is_null());
        assert_eq!(quote.as_object().unwrap().len(), 58);
        // Envelope meta object.
        assert_eq!(frame["data"][1]["mdhis_more_data"], false);
        assert_eq!(frame["data"][1]["account_id"], "");

        // Same bid volume, new last price: the diff carries only what moved.
        state.hub.publish(&tick("x", 10.01, 9.99, 5));
        handle_peek(&state, &client);

        let frame = next_frame(&mut rx);
        let quote = frame["data"][0]["quotes"]["EX.x"].as_object().unwrap();
        assert_eq!(quote["last_price"], 10.01);
        assert!(quote.contains_key("timestamp"));
        assert!(!quote.contains_key("bid_price1"));
        assert!(!quote.contains_key("bid_volume1"));
        assert!(!quote.contains_key("ask_price1"));
    }

    #[test]
    fn empty_first_peek_sends_nothing_and_does_not_suspend() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");

        handle_peek(&state, &client);
        assert!(rx.try_recv().is_err());
        // Never delivered anything: not suspended either.
        assert!(!client.suspended.load(Ordering::Acquire));
    }

    #[test]
    fn peek_with_no_news_suspends_and_wake_resumes() {
        let (state, mut wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");
        subscribe(&state, &client, "EX.y");

        state.hub.publish(&tick("x", 10.0, 9.99, 5));
        wake_rx.try_recv().unwrap();
        handle_peek(&state, &client);
        next_frame(&mut rx);

        // No new quotes anywhere: this peek suspends the client.
        handle_peek(&state, &client);
        assert!(rx.try_recv().is_err());
        assert!(client.suspended.load(Ordering::Acquire));

        // A quote for the other instrument arrives; the claim-and-peek path
        // the wake pump runs delivers it.
        state.hub.publish(&tick("y", 5.0, 4.99, 1));
        let woken = state.registry.claim_suspended(&wake_rx.try_recv().unwrap());
        assert_eq!(woken.len(), 1);
        handle_peek(&state, &woken[0]);

        let frame = next_frame(&mut rx);
        let quotes = frame["data"][0]["quotes"].as_object().unwrap();
        assert!(quotes.contains_key("EX.y"));
        assert!(!quotes.contains_key("EX.x"));
        assert!(!client.suspended.load(Ordering::Acquire));
    }

    #[test]
    fn same_version_is_not_redelivered() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");

        state.hub.publish(&tick("x", 10.0, 9.99, 5));
        handle_peek(&state, &client);
        next_frame(&mut rx);

        handle_peek(&state, &client);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn versions_observed_are_monotonic() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");

        let mut seen = 0u64;
        for round in 1..=5 {
            state.hub.publish(&tick("x", 10.0 + round as f64, 9.99, 5));
            handle_peek(&state, &client);
            let _ = next_frame(&mut rx);
            let version = common::lock(&client.quotes).last_versions["x"];
            assert!(version > seen);
            seen = version;
        }
    }

    #[test]
    fn unsubscribed_instrument_is_not_delivered() {
        let (state, _wake_rx) = app_state();
        let (a, mut a_rx) = connect(&state);
        let (b, mut b_rx) = connect(&state);
        subscribe(&state, &a, "EX.x");
        subscribe(&state, &b, "EX.x");
        subscribe(&state, &b, "EX.y");

        state.hub.publish(&tick("x", 10.0, 9.99, 5));
        state.hub.publish(&tick("y", 5.0, 4.99, 1));

        handle_peek(&state, &a);
        let frame = next_frame(&mut a_rx);
        let quotes = frame["data"][0]["quotes"].as_object().unwrap();
        assert!(quotes.contains_key("EX.x"));
        assert!(!quotes.contains_key("EX.y"));

        handle_peek(&state, &b);
        let frame = next_frame(&mut b_rx);
        assert_eq!(frame["data"][0]["quotes"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn client_that_drops_subscription_mid_peek_keeps_maps_clean() {
        let (state, _wake_rx) = app_state();
        let (client, mut rx) = connect(&state);
        subscribe(&state, &client, "EX.x");

        state.hub.publish(&tick("x", 10.0, 9.99, 5));
        handle_peek(&state, &client);
        next_frame(&mut rx);

        // Unsubscribe everything, as the disconnect path does.
        {
            let mut quotes = common::lock(&client.quotes);
            quotes.subscriptions.clear();
            quotes.last_sent.clear();
            quotes.last_versions.clear();
        }

        state.hub.publish(&tick("x", 10.5, 9.99, 5));
        handle_peek(&state, &client);
        assert!(rx.try_recv().is_err());
        let quotes = common::lock(&client.quotes);
        assert!(quotes.last_sent.is_empty());
        assert!(quotes.last_versions.is_empty());
    }
}
