//! The vendor feed boundary.
//!
//! The native market-data binding lives out of tree; these traits are its
//! seam. A [`FeedConnector`] produces one [`FeedHandle`] per session, bound
//! to a per-session flow directory, and delivers events through the
//! [`FeedSpi`] callbacks on threads the binding owns. Nothing above this
//! boundary knows how the transport works.

use quotes::DepthTick;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Error reported by the feed binding, either synchronously from a request
/// or inside a response callback.
#[derive(Debug, Clone, Error)]
#[error("feed error {code}: {message}")]
pub struct FeedRspError {
    pub code: i32,
    pub message: String,
}

impl FeedRspError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Callbacks delivered by the feed binding. Implemented by the session's
/// bridge; every method may be invoked from a binding-owned thread.
pub trait FeedSpi: Send + Sync {
    fn on_front_connected(&self);
    fn on_front_disconnected(&self, reason: i32);
    /// `None` on success, the rejection otherwise.
    fn on_login(&self, error: Option<FeedRspError>);
    fn on_sub_ack(&self, raw_id: &str, error: Option<FeedRspError>);
    fn on_unsub_ack(&self, raw_id: &str, error: Option<FeedRspError>);
    /// The hot path.
    fn on_depth(&self, tick: &DepthTick);
    fn on_error(&self, error: FeedRspError);
}

/// Live handle to one upstream endpoint. Dropping it releases the vendor
/// resources.
pub trait FeedHandle: Send + Sync {
    fn login(&self, broker_id: &str, user_id: &str, password: &str) -> Result<(), FeedRspError>;
    fn subscribe(&self, raw_id: &str) -> Result<(), FeedRspError>;
    fn unsubscribe(&self, raw_id: &str) -> Result<(), FeedRspError>;
}

/// Factory for feed handles; one `connect` per session start.
pub trait FeedConnector: Send + Sync {
    fn connect(
        &self,
        flow_dir: &Path,
        front_addr: &str,
        spi: Arc<dyn FeedSpi>,
    ) -> Result<Box<dyn FeedHandle>, FeedRspError>;
}
