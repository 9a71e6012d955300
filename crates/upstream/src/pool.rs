//! Owner of the upstream session fleet, plus the health monitor.
//!
//! The monitor thread sweeps the fleet every `health_check_interval`: a
//! session in ERROR, or DISCONNECTED with a climbing error count, gets
//! restarted — synchronously on the monitor thread, gated by a per-session
//! backoff window so a flapping endpoint cannot cause a restart storm.

use crate::session::{SessionStatus, UpstreamSession};
use common::lock;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Disconnected sessions below this error count are left for the vendor
/// binding's own reconnect; above it the monitor steps in.
const DISCONNECT_ERROR_THRESHOLD: u32 = 5;

/// Minimum spacing between restart attempts of one session.
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

pub struct SessionPool {
    sessions: Mutex<HashMap<String, Arc<UpstreamSession>>>,
    /// Server-wide running flag, shared with the sessions.
    running: Arc<AtomicBool>,
    health_check_interval: Duration,
    monitor_running: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    next_restart_allowed: Mutex<HashMap<String, Instant>>,
}

impl SessionPool {
    pub fn new(health_check_interval: Duration, running: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            running,
            health_check_interval,
            monitor_running: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
            next_restart_allowed: Mutex::new(HashMap::new()),
        })
    }

    /// Register a session. Refused on a duplicate id.
    pub fn add(&self, session: Arc<UpstreamSession>) -> bool {
        let mut sessions = lock(&self.sessions);
        let id = session.id().to_owned();
        if sessions.contains_key(&id) {
            error!(session = %id, "session already exists");
            return false;
        }
        info!(session = %id, "added upstream session");
        sessions.insert(id, session);
        self.update_metrics();
        true
    }

    /// Stop and drop a session.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = lock(&self.sessions).remove(session_id);
        match removed {
            Some(session) => {
                session.stop();
                info!(session = session_id, "removed upstream session");
                self.update_metrics();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<UpstreamSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<UpstreamSession>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Sessions that are LOGGED_IN and under capacity, in stable id order so
    /// round-robin placement is deterministic.
    pub fn available(&self) -> Vec<Arc<UpstreamSession>> {
        let mut available: Vec<_> = lock(&self.sessions)
            .values()
            .filter(|s| s.can_accept_more())
            .cloned()
            .collect();
        available.sort_by(|a, b| a.id().cmp(b.id()));
        available
    }

    pub fn total(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Sessions currently LOGGED_IN.
    pub fn active(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|s| s.status() == SessionStatus::LoggedIn)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        lock(&self.sessions)
            .values()
            .map(|s| s.subscription_count())
            .sum()
    }

    /// Start every stopped session and bring up the health monitor.
    pub fn start_all(self: &Arc<Self>) -> bool {
        let sessions = self.all();
        let mut all_started = true;
        for session in &sessions {
            if session.status() == SessionStatus::Disconnected && !session.start() {
                error!(session = session.id(), "failed to start session");
                all_started = false;
            }
        }
        self.start_monitor();
        info!(count = sessions.len(), "started upstream sessions");
        all_started
    }

    /// Stop the monitor, then every session.
    pub fn stop_all(&self) {
        self.stop_monitor();
        for session in self.all() {
            session.stop();
        }
        info!("stopped all upstream sessions");
    }

    fn start_monitor(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::clone(self);
        let handle = std::thread::spawn(move || pool.monitor_loop());
        *lock(&self.monitor) = Some(handle);
        info!("started session health monitor");
    }

    fn stop_monitor(&self) {
        self.monitor_running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.monitor).take() {
            if handle.join().is_err() {
                warn!("health monitor thread panicked");
            }
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        while self.monitor_running.load(Ordering::Acquire) && self.running.load(Ordering::Acquire)
        {
            self.health_sweep();
            self.update_metrics();

            // Stepped sleep so shutdown completes within one second.
            let steps = self.health_check_interval.as_secs().max(1);
            for _ in 0..steps {
                if !self.monitor_running.load(Ordering::Acquire) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// One pass over the fleet; restarts run inline on the calling thread.
    pub fn health_sweep(self: &Arc<Self>) {
        for session in self.all() {
            let status = session.status();
            let unhealthy = status == SessionStatus::Error
                || (status == SessionStatus::Disconnected
                    && session.error_count() > DISCONNECT_ERROR_THRESHOLD);
            if !unhealthy {
                continue;
            }

            if !self.restart_permitted(session.id()) {
                continue;
            }
            warn!(
                session = session.id(),
                status = status.as_str(),
                errors = session.error_count(),
                "session unhealthy, attempting restart"
            );
            session.restart();
        }
    }

    /// Backoff gate: at most one restart attempt per session per window.
    fn restart_permitted(&self, session_id: &str) -> bool {
        let mut next_allowed = lock(&self.next_restart_allowed);
        let now = Instant::now();
        match next_allowed.get(session_id) {
            Some(&at) if now < at => false,
            _ => {
                next_allowed.insert(session_id.to_owned(), now + RESTART_BACKOFF);
                true
            }
        }
    }

    fn update_metrics(&self) {
        gauge!("md_upstream_sessions").set(self.total() as f64);
        gauge!("md_upstream_active_sessions").set(self.active() as f64);
        gauge!("md_upstream_subscriptions").set(self.total_subscriptions() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{build_session, log_in, session_config, MockConnector, RecordingEvents};
    use crate::session::UpstreamSession;
    use quotes::QuoteHub;

    fn pool_with(running: bool) -> Arc<SessionPool> {
        SessionPool::new(
            Duration::from_secs(30),
            Arc::new(AtomicBool::new(running)),
        )
    }

    #[test]
    fn add_rejects_duplicate_ids() {
        let pool = pool_with(true);
        let (a, _, _) = build_session("s1", 10);
        let (b, _, _) = build_session("s1", 10);
        assert!(pool.add(a));
        assert!(!pool.add(b));
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn available_filters_on_login_and_capacity() {
        let pool = pool_with(true);
        let (logged_in, connector, _) = build_session("s1", 2);
        log_in(&logged_in, &connector);
        let (full, full_connector, _) = build_session("s2", 1);
        log_in(&full, &full_connector);
        assert!(full.subscribe("rb2410"));
        let (cold, _, _) = build_session("s3", 2);

        pool.add(logged_in);
        pool.add(full);
        pool.add(cold);

        let available = pool.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id(), "s1");
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.total_subscriptions(), 1);
    }

    #[test]
    fn available_order_is_stable() {
        let pool = pool_with(true);
        for id in ["s3", "s1", "s2"] {
            let (session, connector, _) = build_session(id, 10);
            log_in(&session, &connector);
            pool.add(session);
        }
        let ids: Vec<_> = pool.available().iter().map(|s| s.id().to_owned()).collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);
    }

    #[test]
    fn remove_stops_the_session() {
        let pool = pool_with(true);
        let (session, connector, _) = build_session("s1", 10);
        log_in(&session, &connector);
        pool.add(session.clone());

        assert!(pool.remove("s1"));
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(!pool.remove("s1"));
    }

    #[test]
    fn health_sweep_restarts_error_sessions_with_backoff() {
        let connector = Arc::new(MockConnector::default());
        let events = Arc::new(RecordingEvents::default());
        let (hub, _wake_rx) = QuoteHub::new(8);
        let hub = Arc::new(hub);
        let running = Arc::new(AtomicBool::new(true));
        let session = UpstreamSession::new(
            session_config("s1", 10),
            connector.clone(),
            events,
            hub,
            running.clone(),
        );
        log_in(&session, &connector);
        // Push the session into ERROR through the callback surface.
        for i in 0..=11 {
            connector.last_spi().on_error(crate::api::FeedRspError::new(i, "x"));
        }
        assert_eq!(session.status(), SessionStatus::Error);

        let pool = SessionPool::new(Duration::from_secs(30), running);
        pool.add(session.clone());

        pool.health_sweep();
        // Restart went through: stop + fresh start, so a second connect.
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
        assert_eq!(session.status(), SessionStatus::Connecting);

        // Force ERROR again; backoff suppresses an immediate second restart.
        connector.last_spi().on_front_connected();
        connector
            .last_spi()
            .on_login(Some(crate::api::FeedRspError::new(3, "boom")));
        assert_eq!(session.status(), SessionStatus::Error);
        pool.health_sweep();
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn healthy_sessions_are_left_alone() {
        let pool = pool_with(true);
        let (session, connector, _) = build_session("s1", 10);
        log_in(&session, &connector);
        pool.add(session.clone());

        pool.health_sweep();
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);
        assert_eq!(session.status(), SessionStatus::LoggedIn);
    }

    #[test]
    fn disconnected_needs_error_count_before_restart() {
        let pool = pool_with(true);
        let (session, connector, _) = build_session("s1", 10);
        log_in(&session, &connector);
        let spi = connector.last_spi();
        spi.on_front_disconnected(0x1001);
        assert_eq!(session.status(), SessionStatus::Disconnected);
        pool.add(session.clone());

        // One disconnect error is below the threshold.
        pool.health_sweep();
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);

        for i in 0..5 {
            spi.on_error(crate::api::FeedRspError::new(i, "x"));
        }
        pool.health_sweep();
        assert_eq!(connector.connects.load(Ordering::Relaxed), 2);
    }
}
