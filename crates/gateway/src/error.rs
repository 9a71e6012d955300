//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client not found.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Per-client send queue is gone (client disconnected).
    #[error("channel send error")]
    ChannelSend,

    /// Failed to bind the downstream listener.
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),
}

impl From<tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
