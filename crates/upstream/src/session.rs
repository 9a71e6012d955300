//! One upstream session: connect, login, subscribe, quote stream, fail,
//! restart.
//!
//! Lifecycle: DISCONNECTED → CONNECTING → CONNECTED → LOGGED_IN, with ERROR
//! as the terminal state the health monitor recovers from. The session owns
//! the vendor handle and a capacity-bounded subscription set; control-plane
//! outcomes (acks, disconnects) are forwarded to the dispatcher through the
//! [`SessionEvents`] trait, depth ticks go straight into the quote hub.

use crate::api::{FeedConnector, FeedHandle, FeedRspError, FeedSpi};
use common::{lock, UpstreamConfig};
use metrics::counter;
use quotes::{DepthTick, QuoteHub};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

/// Working directories for the vendor binding live under here, one per
/// session id.
const FLOW_DIR: &str = "./upstream_flow";

/// Cumulative callback errors beyond this force the session into ERROR.
const ERROR_LIMIT: u32 = 10;

const RESTART_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    LoggedIn = 3,
    Error = 4,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::LoggedIn,
            4 => Self::Error,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::LoggedIn => "LOGGED_IN",
            Self::Error => "ERROR",
        }
    }
}

/// Control-plane notifications a session raises toward the dispatcher.
pub trait SessionEvents: Send + Sync {
    fn on_subscription_success(&self, session_id: &str, raw_id: &str);
    fn on_subscription_failed(&self, session_id: &str, raw_id: &str);
    fn on_unsubscription_success(&self, session_id: &str, raw_id: &str);
    fn handle_connection_failure(&self, session_id: &str);
    fn handle_connection_recovery(&self, session_id: &str);
}

pub struct UpstreamSession {
    config: UpstreamConfig,
    connector: Arc<dyn FeedConnector>,
    events: Arc<dyn SessionEvents>,
    hub: Arc<QuoteHub>,
    /// Server-wide running flag; restarts are skipped once it clears.
    running: Arc<AtomicBool>,
    api: Mutex<Option<Box<dyn FeedHandle>>>,
    status: AtomicU8,
    error_count: AtomicU32,
    subs: Mutex<HashSet<String>>,
}

impl UpstreamSession {
    pub fn new(
        config: UpstreamConfig,
        connector: Arc<dyn FeedConnector>,
        events: Arc<dyn SessionEvents>,
        hub: Arc<QuoteHub>,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            events,
            hub,
            running,
            api: Mutex::new(None),
            status: AtomicU8::new(SessionStatus::Disconnected as u8),
            error_count: AtomicU32::new(0),
            subs: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.session_id
    }

    pub fn capacity(&self) -> usize {
        self.config.max_subscriptions
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn bump_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subs).len()
    }

    pub fn can_accept_more(&self) -> bool {
        self.status() == SessionStatus::LoggedIn
            && self.subscription_count() < self.config.max_subscriptions
    }

    /// Register callbacks and initiate the connection. Valid only from
    /// DISCONNECTED.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut api = lock(&self.api);
        if self.status() != SessionStatus::Disconnected {
            warn!(session = self.id(), status = self.status().as_str(), "start refused");
            return false;
        }
        self.set_status(SessionStatus::Connecting);

        let flow_dir = PathBuf::from(FLOW_DIR).join(self.id());
        if let Err(err) = std::fs::create_dir_all(&flow_dir) {
            warn!(session = self.id(), %err, "failed to create flow directory");
        }

        let spi = Arc::new(SpiBridge {
            session: Arc::downgrade(self),
        });
        match self
            .connector
            .connect(&flow_dir, &self.config.front_addr, spi)
        {
            Ok(handle) => {
                *api = Some(handle);
                info!(session = self.id(), front = %self.config.front_addr, "session starting");
                true
            }
            Err(err) => {
                error!(session = self.id(), %err, "failed to connect feed");
                self.set_status(SessionStatus::Error);
                self.bump_error();
                false
            }
        }
    }

    /// Release the vendor handle and clear local state. Idempotent.
    pub fn stop(&self) {
        self.set_status(SessionStatus::Disconnected);
        let handle = lock(&self.api).take();
        drop(handle);
        lock(&self.subs).clear();
        info!(session = self.id(), "session stopped");
    }

    /// Stop, pause, start again; skipped when the server is shutting down.
    pub fn restart(self: &Arc<Self>) -> bool {
        info!(session = self.id(), "restarting session");
        self.stop();
        std::thread::sleep(RESTART_PAUSE);

        if !self.running.load(Ordering::Acquire) {
            info!(session = self.id(), "server stopping, restart cancelled");
            return false;
        }
        counter!("md_session_restarts_total").increment(1);
        self.start()
    }

    /// Issue an upstream subscribe. Duplicate requests succeed without a
    /// vendor call; a full session refuses.
    pub fn subscribe(&self, raw_id: &str) -> bool {
        if self.status() != SessionStatus::LoggedIn {
            warn!(session = self.id(), raw_id, "not ready for subscription");
            return false;
        }
        let mut subs = lock(&self.subs);
        if subs.contains(raw_id) {
            return true;
        }
        if subs.len() >= self.config.max_subscriptions {
            warn!(session = self.id(), raw_id, "subscription capacity reached");
            return false;
        }
        let api = lock(&self.api);
        let Some(handle) = api.as_ref() else {
            return false;
        };
        match handle.subscribe(raw_id) {
            Ok(()) => {
                subs.insert(raw_id.to_owned());
                info!(session = self.id(), raw_id, "subscribed");
                true
            }
            Err(err) => {
                error!(session = self.id(), raw_id, %err, "subscribe refused");
                self.bump_error();
                false
            }
        }
    }

    pub fn unsubscribe(&self, raw_id: &str) -> bool {
        if self.status() != SessionStatus::LoggedIn {
            return false;
        }
        let mut subs = lock(&self.subs);
        if !subs.contains(raw_id) {
            return true;
        }
        let api = lock(&self.api);
        let Some(handle) = api.as_ref() else {
            return false;
        };
        match handle.unsubscribe(raw_id) {
            Ok(()) => {
                subs.remove(raw_id);
                info!(session = self.id(), raw_id, "unsubscribed");
                true
            }
            Err(err) => {
                error!(session = self.id(), raw_id, %err, "unsubscribe refused");
                self.bump_error();
                false
            }
        }
    }

    // Callback handlers, invoked through the SPI bridge.

    fn front_connected(&self) {
        info!(session = self.id(), "front connected");
        self.set_status(SessionStatus::Connected);
        self.login();
    }

    fn login(&self) {
        let api = lock(&self.api);
        let Some(handle) = api.as_ref() else {
            warn!(session = self.id(), "front connected without a handle");
            return;
        };
        // Market-data login is anonymous: broker id only.
        match handle.login(&self.config.broker_id, "", "") {
            Ok(()) => info!(session = self.id(), "login request sent"),
            Err(err) => {
                error!(session = self.id(), %err, "failed to send login request");
                self.set_status(SessionStatus::Error);
                self.bump_error();
            }
        }
    }

    fn front_disconnected(&self, reason: i32) {
        warn!(session = self.id(), reason, "front disconnected");
        self.set_status(SessionStatus::Disconnected);
        self.bump_error();
        self.events.handle_connection_failure(self.id());
    }

    fn login_response(&self, error: Option<FeedRspError>) {
        match error {
            None => {
                info!(session = self.id(), "login successful");
                self.set_status(SessionStatus::LoggedIn);
                self.events.handle_connection_recovery(self.id());
            }
            Some(err) => {
                error!(session = self.id(), %err, "login failed");
                self.set_status(SessionStatus::Error);
                self.bump_error();
            }
        }
    }

    fn sub_ack(&self, raw_id: &str, error: Option<FeedRspError>) {
        match error {
            None => {
                info!(session = self.id(), raw_id, "subscription acknowledged");
                self.events.on_subscription_success(self.id(), raw_id);
            }
            Some(err) => {
                error!(session = self.id(), raw_id, %err, "subscription rejected");
                self.bump_error();
                self.events.on_subscription_failed(self.id(), raw_id);
            }
        }
    }

    fn unsub_ack(&self, raw_id: &str, error: Option<FeedRspError>) {
        match error {
            None => self.events.on_unsubscription_success(self.id(), raw_id),
            Some(err) => {
                error!(session = self.id(), raw_id, %err, "unsubscription rejected");
                self.bump_error();
            }
        }
    }

    fn depth(&self, tick: &DepthTick) {
        self.hub.publish(tick);
    }

    fn rsp_error(&self, err: FeedRspError) {
        error!(session = self.id(), %err, "feed error");
        self.bump_error();
        if self.error_count() > ERROR_LIMIT {
            error!(session = self.id(), "too many errors, marking session failed");
            self.set_status(SessionStatus::Error);
        }
    }
}

/// Narrow adapter handed to the vendor binding; forwards callbacks into the
/// session for as long as it is alive.
struct SpiBridge {
    session: Weak<UpstreamSession>,
}

impl FeedSpi for SpiBridge {
    fn on_front_connected(&self) {
        if let Some(session) = self.session.upgrade() {
            session.front_connected();
        }
    }

    fn on_front_disconnected(&self, reason: i32) {
        if let Some(session) = self.session.upgrade() {
            session.front_disconnected(reason);
        }
    }

    fn on_login(&self, error: Option<FeedRspError>) {
        if let Some(session) = self.session.upgrade() {
            session.login_response(error);
        }
    }

    fn on_sub_ack(&self, raw_id: &str, error: Option<FeedRspError>) {
        if let Some(session) = self.session.upgrade() {
            session.sub_ack(raw_id, error);
        }
    }

    fn on_unsub_ack(&self, raw_id: &str, error: Option<FeedRspError>) {
        if let Some(session) = self.session.upgrade() {
            session.unsub_ack(raw_id, error);
        }
    }

    fn on_depth(&self, tick: &DepthTick) {
        if let Some(session) = self.session.upgrade() {
            session.depth(tick);
        }
    }

    fn on_error(&self, error: FeedRspError) {
        if let Some(session) = self.session.upgrade() {
            session.rsp_error(error);
        }
    }
}
