//! Per-instrument subscription bookkeeping.

use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

/// Downstream client identity.
pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Created, not yet placed on a session.
    Pending,
    /// Issued upstream, awaiting the ack.
    Subscribing,
    /// Acknowledged; quotes are flowing.
    Active,
    /// Placement or ack failed; eligible for retry.
    Failed,
    /// No such subscription.
    Cancelled,
}

/// State of one instrument's upstream subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub raw_id: String,
    /// Session currently holding (or issuing) the subscription; empty while
    /// unplaced.
    pub assigned_session: String,
    pub status: SubscriptionStatus,
    /// Clients that want this instrument; the subscription lives exactly as
    /// long as this set is non-empty.
    pub requesting_clients: HashSet<ClientId>,
    pub created_at: Instant,
    pub last_update_at: Instant,
    pub retry_count: u32,
}

impl SubscriptionInfo {
    pub fn new(raw_id: &str) -> Self {
        let now = Instant::now();
        Self {
            raw_id: raw_id.to_owned(),
            assigned_session: String::new(),
            status: SubscriptionStatus::Pending,
            requesting_clients: HashSet::new(),
            created_at: now,
            last_update_at: now,
            retry_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_update_at = Instant::now();
    }
}
