//! Client state and registry management.
//!
//! Uses lock-free DashMap for high-throughput concurrent access; the
//! per-client quote state (subscription set, last-sent records, last-seen
//! versions) lives behind one client-scoped mutex.

use crate::error::{GatewayError, Result};
use axum::extract::ws::Message;
use chrono::Utc;
use common::lock;
use dashmap::{DashMap, DashSet};
use quotes::QuoteRecord;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Quote delivery state for one client, guarded as a unit.
#[derive(Default)]
pub struct ClientQuotes {
    /// Raw instrument ids this client requested.
    pub subscriptions: HashSet<String>,
    /// Last record sent per instrument; diff baseline.
    pub last_sent: HashMap<String, QuoteRecord>,
    /// Last cache version seen per instrument.
    pub last_versions: HashMap<String, u64>,
}

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier; doubles as the downstream session id.
    pub id: ClientId,
    /// Channel to the client's single-flight writer task.
    pub tx: tokio::sync::mpsc::UnboundedSender<Message>,
    /// Subscription set and diff baselines.
    pub quotes: Mutex<ClientQuotes>,
    /// Set when a poll found nothing new; cleared by the wake pump.
    pub suspended: AtomicBool,
    /// Timestamp when client connected.
    pub connected_at: i64,
}

impl ClientState {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            quotes: Mutex::new(ClientQuotes::default()),
            suspended: AtomicBool::new(false),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Queue a serialized frame for this client.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Serialize and queue a frame.
    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<()> {
        self.send_text(serde_json::to_string(frame)?)
    }

    /// Record interest in a raw instrument id.
    pub fn add_subscription(&self, raw_id: &str) {
        lock(&self.quotes).subscriptions.insert(raw_id.to_owned());
    }

    pub fn is_subscribed(&self, raw_id: &str) -> bool {
        lock(&self.quotes).subscriptions.contains(raw_id)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.quotes).subscriptions.len()
    }
}

/// Lock-free registry of connected clients.
///
/// Maintains:
/// - Client ID → Client State mapping
/// - Instrument → Client IDs reverse index used by the wake pump
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// raw_id → ids of clients subscribed to it.
    by_instrument: DashMap<String, DashSet<ClientId>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            by_instrument: DashMap::new(),
        }
    }

    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!(client = %id, "client registered");
        id
    }

    /// Drop a client and scrub it from the reverse index.
    pub fn unregister(&self, client_id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            let subscriptions = {
                let quotes = lock(&client.quotes);
                quotes.subscriptions.iter().cloned().collect::<Vec<_>>()
            };
            for raw_id in subscriptions {
                if let Some(set) = self.by_instrument.get(&raw_id) {
                    set.remove(client_id);
                }
            }
            info!(client = %client_id, "client unregistered");
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|entry| entry.clone())
    }

    /// Add a reverse-index entry for one (instrument, client) pair.
    pub fn index_instrument(&self, raw_id: &str, client_id: ClientId) {
        self.by_instrument
            .entry(raw_id.to_owned())
            .or_default()
            .insert(client_id);
    }

    /// Claim the suspended subscribers of an instrument: each returned
    /// client had its suspended flag set and has now been cleared, so a
    /// concurrent wake cannot peek the same client twice.
    pub fn claim_suspended(&self, raw_id: &str) -> Vec<Arc<ClientState>> {
        let Some(ids) = self.by_instrument.get(raw_id) else {
            return Vec::new();
        };
        let mut claimed = Vec::new();
        for id in ids.iter() {
            if let Some(client) = self.clients.get(&*id) {
                if client.suspended.swap(false, Ordering::AcqRel) {
                    claimed.push(client.clone());
                }
            }
        }
        if !claimed.is_empty() {
            debug!(raw_id, count = claimed.len(), "claimed suspended clients");
        }
        claimed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn instrument_count(&self) -> usize {
        self.by_instrument.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
