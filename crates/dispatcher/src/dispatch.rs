//! The dispatcher proper.
//!
//! All maps sit behind coarse mutexes acquired in a fixed order
//! (subscriptions → clients → sessions → retry). Vendor calls are issued
//! only after every map guard is dropped, so an ack arriving inline can
//! never deadlock against the maps.

use crate::subscription::{ClientId, SubscriptionInfo, SubscriptionStatus};
use common::lock;
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};
use upstream::{SessionEvents, SessionPool, UpstreamSession};

/// FAILED subscriptions older than this are garbage-collected by the
/// maintenance pass.
const FAILED_TTL: Duration = Duration::from_secs(600);

pub struct Dispatcher {
    pool: OnceLock<Arc<SessionPool>>,
    /// raw_id → subscription state.
    subs: Mutex<HashMap<String, SubscriptionInfo>>,
    /// client → raw_ids it requested.
    client_subs: Mutex<HashMap<ClientId, HashSet<String>>>,
    /// session → raw_ids acked on it; the failover mirror.
    session_subs: Mutex<HashMap<String, HashSet<String>>>,
    /// Instruments awaiting a maintenance retry.
    retry_set: Mutex<HashSet<String>>,
    round_robin: AtomicUsize,
    max_retry: u32,
    maintenance_interval: Duration,
    auto_failover: bool,
    running: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(max_retry: u32, maintenance_interval: Duration, auto_failover: bool) -> Arc<Self> {
        Arc::new(Self {
            pool: OnceLock::new(),
            subs: Mutex::new(HashMap::new()),
            client_subs: Mutex::new(HashMap::new()),
            session_subs: Mutex::new(HashMap::new()),
            retry_set: Mutex::new(HashSet::new()),
            round_robin: AtomicUsize::new(0),
            max_retry,
            maintenance_interval,
            auto_failover,
            running: AtomicBool::new(true),
            maintenance: Mutex::new(None),
        })
    }

    /// Wire in the session pool; must happen before the first subscription.
    pub fn attach_pool(&self, pool: Arc<SessionPool>) {
        if self.pool.set(pool).is_err() {
            warn!("session pool already attached");
        }
    }

    fn pool(&self) -> Option<&Arc<SessionPool>> {
        let pool = self.pool.get();
        if pool.is_none() {
            error!("dispatcher used before a session pool was attached");
        }
        pool
    }

    /// Round-robin pick over the available sessions, optionally excluding
    /// one (the session being failed over from).
    fn select_session(&self, exclude: Option<&str>) -> Option<Arc<UpstreamSession>> {
        let pool = self.pool()?;
        let mut available = pool.available();
        if let Some(exclude) = exclude {
            available.retain(|s| s.id() != exclude);
        }
        if available.is_empty() {
            return None;
        }
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % available.len();
        Some(available[index].clone())
    }

    /// Mark a subscription FAILED and enqueue it for retry while its budget
    /// lasts. `increment` bumps the retry counter first.
    fn mark_failed(&self, raw_id: &str, increment: bool) {
        let should_retry = {
            let mut subs = lock(&self.subs);
            match subs.get_mut(raw_id) {
                Some(info) => {
                    info.status = SubscriptionStatus::Failed;
                    if increment {
                        info.retry_count += 1;
                    }
                    info.touch();
                    info.retry_count < self.max_retry
                }
                None => false,
            }
        };
        if should_retry {
            lock(&self.retry_set).insert(raw_id.to_owned());
        }
    }

    /// Register `client`'s interest in `raw_id`, issuing the upstream
    /// subscribe when this is the first requester. Returns false when
    /// placement failed (the instrument stays queued for retry).
    pub fn add_subscription(&self, client: ClientId, raw_id: &str) -> bool {
        let session = {
            let mut subs = lock(&self.subs);
            let mut client_subs = lock(&self.client_subs);
            client_subs
                .entry(client)
                .or_default()
                .insert(raw_id.to_owned());

            if let Some(info) = subs.get_mut(raw_id) {
                info.requesting_clients.insert(client);
                info!(%client, raw_id, "joined existing subscription");
                return true;
            }

            let mut info = SubscriptionInfo::new(raw_id);
            info.requesting_clients.insert(client);

            match self.select_session(None) {
                Some(session) => {
                    info.assigned_session = session.id().to_owned();
                    info.status = SubscriptionStatus::Subscribing;
                    subs.insert(raw_id.to_owned(), info);
                    self.update_metrics(subs.len());
                    session
                }
                None => {
                    error!(raw_id, "no available session for subscription");
                    info.status = SubscriptionStatus::Failed;
                    let retry = info.retry_count < self.max_retry;
                    subs.insert(raw_id.to_owned(), info);
                    self.update_metrics(subs.len());
                    drop(client_subs);
                    drop(subs);
                    if retry {
                        lock(&self.retry_set).insert(raw_id.to_owned());
                    }
                    return false;
                }
            }
        };

        info!(raw_id, session = session.id(), "placing new subscription");
        if session.subscribe(raw_id) {
            true
        } else {
            self.mark_failed(raw_id, false);
            false
        }
    }

    /// Drop `client`'s interest; the last requester triggers the upstream
    /// unsubscribe and removes the entry.
    pub fn remove_subscription(&self, client: ClientId, raw_id: &str) -> bool {
        let assigned = {
            let mut subs = lock(&self.subs);
            let mut client_subs = lock(&self.client_subs);

            if let Some(set) = client_subs.get_mut(&client) {
                set.remove(raw_id);
                if set.is_empty() {
                    client_subs.remove(&client);
                }
            }

            let Some(info) = subs.get_mut(raw_id) else {
                return true;
            };
            info.requesting_clients.remove(&client);
            if !info.requesting_clients.is_empty() {
                info!(
                    raw_id,
                    remaining = info.requesting_clients.len(),
                    "subscription kept, still requested"
                );
                return true;
            }
            let assigned = info.assigned_session.clone();
            subs.remove(raw_id);
            self.update_metrics(subs.len());
            assigned
        };

        if !assigned.is_empty() {
            if let Some(session) = self.pool().and_then(|p| p.get(&assigned)) {
                session.unsubscribe(raw_id);
            }
        }
        info!(raw_id, "subscription removed");
        true
    }

    /// Remove everything a disconnecting client requested.
    pub fn remove_all_for_client(&self, client: ClientId) {
        let instruments: Vec<String> = lock(&self.client_subs)
            .get(&client)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for raw_id in instruments {
            self.remove_subscription(client, &raw_id);
        }
        info!(%client, "removed all subscriptions for client");
    }

    pub fn subscriptions_for_client(&self, client: ClientId) -> Vec<String> {
        lock(&self.client_subs)
            .get(&client)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clients_for_instrument(&self, raw_id: &str) -> Vec<ClientId> {
        lock(&self.subs)
            .get(raw_id)
            .map(|info| info.requesting_clients.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn status_of(&self, raw_id: &str) -> SubscriptionStatus {
        lock(&self.subs)
            .get(raw_id)
            .map(|info| info.status)
            .unwrap_or(SubscriptionStatus::Cancelled)
    }

    pub fn assigned_session_of(&self, raw_id: &str) -> Option<String> {
        lock(&self.subs)
            .get(raw_id)
            .map(|info| info.assigned_session.clone())
            .filter(|s| !s.is_empty())
    }

    pub fn total_subscriptions(&self) -> usize {
        lock(&self.subs).len()
    }

    pub fn retry_backlog(&self) -> usize {
        lock(&self.retry_set).len()
    }

    /// Migrate everything the failed session held (acked or still
    /// in flight) onto surviving sessions.
    fn fail_over(&self, session_id: &str) {
        warn!(session = session_id, "handling session failure");

        let affected: Vec<String> = {
            let mut subs = lock(&self.subs);
            let mut affected = Vec::new();
            for (raw_id, info) in subs.iter_mut() {
                if info.assigned_session == session_id
                    && matches!(
                        info.status,
                        SubscriptionStatus::Active | SubscriptionStatus::Subscribing
                    )
                {
                    info.status = SubscriptionStatus::Failed;
                    info.touch();
                    affected.push(raw_id.clone());
                }
            }
            affected
        };

        for raw_id in &affected {
            if self.auto_failover {
                if let Some(target) = self.select_session(Some(session_id)) {
                    self.migrate(raw_id, session_id, &target);
                    continue;
                }
                error!(raw_id = %raw_id, "no session available for migration");
            }
            self.mark_failed(raw_id, false);
        }

        lock(&self.session_subs).remove(session_id);
        if !affected.is_empty() {
            counter!("md_failovers_total").increment(affected.len() as u64);
        }
        info!(session = session_id, migrated = affected.len(), "failure handling complete");
    }

    fn migrate(&self, raw_id: &str, from: &str, target: &Arc<UpstreamSession>) {
        info!(raw_id, from, to = target.id(), "migrating subscription");
        {
            let mut subs = lock(&self.subs);
            let Some(info) = subs.get_mut(raw_id) else {
                return;
            };
            info.assigned_session = target.id().to_owned();
            info.status = SubscriptionStatus::Subscribing;
            info.retry_count = 0;
            info.touch();
        }
        if !target.subscribe(raw_id) {
            error!(raw_id, to = target.id(), "migration subscribe refused");
            self.mark_failed(raw_id, false);
        }
    }

    /// One attempt per retry-set entry; unsuccessful attempts burn retry
    /// budget so the set drains even with no session ever available.
    fn process_pending(&self) {
        let pending: Vec<String> = {
            let mut retry_set = lock(&self.retry_set);
            retry_set.drain().collect()
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "processing pending subscriptions");

        let mut requeue = HashSet::new();
        for raw_id in pending {
            let target = {
                let mut subs = lock(&self.subs);
                let Some(info) = subs.get_mut(&raw_id) else {
                    continue;
                };
                if info.status != SubscriptionStatus::Failed {
                    continue;
                }
                match self.select_session(None) {
                    Some(session) => {
                        info.assigned_session = session.id().to_owned();
                        info.status = SubscriptionStatus::Subscribing;
                        info.touch();
                        session
                    }
                    None => {
                        info.retry_count += 1;
                        info.touch();
                        if info.retry_count < self.max_retry {
                            requeue.insert(raw_id.clone());
                        } else {
                            warn!(raw_id = %raw_id, "retry budget exhausted");
                        }
                        continue;
                    }
                }
            };

            counter!("md_subscription_retries_total").increment(1);
            if target.subscribe(&raw_id) {
                let mut subs = lock(&self.subs);
                if let Some(info) = subs.get_mut(&raw_id) {
                    info.retry_count = 0;
                }
            } else {
                let mut subs = lock(&self.subs);
                if let Some(info) = subs.get_mut(&raw_id) {
                    info.status = SubscriptionStatus::Failed;
                    info.retry_count += 1;
                    info.touch();
                    if info.retry_count < self.max_retry {
                        requeue.insert(raw_id.clone());
                    }
                }
            }
        }

        if !requeue.is_empty() {
            lock(&self.retry_set).extend(requeue);
        }
    }

    /// Drop FAILED subscriptions that have been dead longer than the TTL,
    /// including their client mirrors and retry entries.
    fn cleanup_expired(&self) {
        let removed: Vec<(String, HashSet<ClientId>)> = {
            let mut subs = lock(&self.subs);
            let mut client_subs = lock(&self.client_subs);
            let expired: Vec<String> = subs
                .iter()
                .filter(|(_, info)| {
                    info.status == SubscriptionStatus::Failed
                        && info.last_update_at.elapsed() > FAILED_TTL
                })
                .map(|(raw_id, _)| raw_id.clone())
                .collect();

            let mut removed = Vec::new();
            for raw_id in expired {
                if let Some(info) = subs.remove(&raw_id) {
                    for client in &info.requesting_clients {
                        if let Some(set) = client_subs.get_mut(client) {
                            set.remove(&raw_id);
                            if set.is_empty() {
                                client_subs.remove(client);
                            }
                        }
                    }
                    removed.push((raw_id, info.requesting_clients));
                }
            }
            self.update_metrics(subs.len());
            removed
        };

        if !removed.is_empty() {
            let mut retry_set = lock(&self.retry_set);
            for (raw_id, _) in &removed {
                retry_set.remove(raw_id);
                info!(raw_id = %raw_id, "cleaned up expired subscription");
            }
        }
    }

    pub fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = lock(&self.maintenance);
        if maintenance.is_some() {
            return;
        }
        let dispatcher = Arc::clone(self);
        *maintenance = Some(std::thread::spawn(move || dispatcher.maintenance_loop()));
        info!(
            interval_secs = self.maintenance_interval.as_secs(),
            max_retry = self.max_retry,
            auto_failover = self.auto_failover,
            "started subscription maintenance"
        );
    }

    fn maintenance_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            self.process_pending();
            self.cleanup_expired();

            let steps = self.maintenance_interval.as_secs().max(1);
            for _ in 0..steps {
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// Stop maintenance and clear all bookkeeping.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.maintenance).take() {
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
        lock(&self.subs).clear();
        lock(&self.client_subs).clear();
        lock(&self.session_subs).clear();
        lock(&self.retry_set).clear();
        info!("dispatcher shut down");
    }

    fn update_metrics(&self, total: usize) {
        gauge!("md_global_subscriptions").set(total as f64);
    }

    #[cfg(test)]
    fn run_maintenance_pass(&self) {
        self.process_pending();
        self.cleanup_expired();
    }

    #[cfg(test)]
    fn backdate(&self, raw_id: &str, age: Duration) {
        let mut subs = lock(&self.subs);
        if let Some(info) = subs.get_mut(raw_id) {
            info.last_update_at = std::time::Instant::now() - age;
        }
    }
}

impl SessionEvents for Dispatcher {
    fn on_subscription_success(&self, session_id: &str, raw_id: &str) {
        {
            let mut subs = lock(&self.subs);
            let Some(info) = subs.get_mut(raw_id) else {
                return;
            };
            info.status = SubscriptionStatus::Active;
            info.touch();
        }
        lock(&self.session_subs)
            .entry(session_id.to_owned())
            .or_default()
            .insert(raw_id.to_owned());
        info!(raw_id, session = session_id, "subscription active");
    }

    fn on_subscription_failed(&self, session_id: &str, raw_id: &str) {
        error!(raw_id, session = session_id, "subscription failed");
        self.mark_failed(raw_id, true);
    }

    fn on_unsubscription_success(&self, session_id: &str, raw_id: &str) {
        let mut session_subs = lock(&self.session_subs);
        if let Some(set) = session_subs.get_mut(session_id) {
            set.remove(raw_id);
            if set.is_empty() {
                session_subs.remove(session_id);
            }
        }
        info!(raw_id, session = session_id, "unsubscription confirmed");
    }

    fn handle_connection_failure(&self, session_id: &str) {
        self.fail_over(session_id);
    }

    fn handle_connection_recovery(&self, session_id: &str) {
        info!(session = session_id, "session recovered");
        self.process_pending();
    }
}
