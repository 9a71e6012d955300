//! Downstream WebSocket gateway.
//!
//! This crate:
//! - Accepts WebSocket connections from quote consumers
//! - Parses the text-frame request protocol (subscribe_quote / peek_message)
//! - Registers interest with the subscription dispatcher
//! - Serves poll-driven differential quote pushes out of the SeqLock cache
//! - Wakes suspended clients when a relevant cache write lands
//!
//! ## Data path
//!
//! ```text
//! upstream callback → QuoteHub (cache write + wake enqueue)
//!         ↓
//! wake pump (tokio task, bounded batches)
//!         ↓
//! peek per suspended client → full/diff frame → per-client send queue
//! ```
//!
//! ## Low-latency design
//!
//! - Lock-free client registry using DashMap
//! - One unbounded send queue per client, drained by a single writer task
//! - Bounded SeqLock reads; a contended instrument skips one cycle instead
//!   of blocking the writer

pub mod client;
pub mod error;
pub mod poll;
pub mod protocol;
pub mod ws_server;

pub use client::{ClientRegistry, ClientState};
pub use error::{GatewayError, Result};
pub use poll::{handle_peek, run_wake_pump};
pub use protocol::ClientRequest;
pub use ws_server::{create_router, AppState};
