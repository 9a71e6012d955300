//! Downstream text-frame protocol.
//!
//! Requests carry an `aid` discriminator; responses are either small fixed
//! frames (welcome, error, subscribe ack) or the `rtn_data` quote envelope
//! assembled in [`crate::poll`].

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "aid", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Subscribe to depth quotes for a comma-separated instrument list.
    /// Each entry may carry an `EXCHANGE.` prefix.
    SubscribeQuote { ins_list: String },
    /// Poll for updates; answered with a full or diff frame, or suspended
    /// until the next relevant quote when nothing changed.
    PeekMessage,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Unsolicited frame sent after the WebSocket handshake.
#[derive(Debug, Clone, Serialize)]
pub struct WelcomeFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub message: &'static str,
    pub session_id: String,
    pub ctp_connected: bool,
    pub timestamp: i64,
}

impl WelcomeFrame {
    pub fn new(session_id: String, ctp_connected: bool) -> Self {
        Self {
            frame_type: "welcome",
            message: "Connected to market data server",
            session_id,
            ctp_connected,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Error frame; the channel stays open.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub message: String,
    pub timestamp: i64,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            frame_type: "error",
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Acknowledgement of a subscribe_quote request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeReply {
    pub aid: &'static str,
    pub status: &'static str,
}

impl SubscribeReply {
    pub fn ok() -> Self {
        Self {
            aid: "subscribe_quote",
            status: "ok",
        }
    }
}

/// Strip the exchange prefix from a display id: `SHFE.rb2410` → `rb2410`.
pub fn strip_exchange_prefix(display_id: &str) -> &str {
    match display_id.split_once('.') {
        Some((_, raw_id)) => raw_id,
        None => display_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_quote() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"aid":"subscribe_quote","ins_list":"SHFE.rb2410,DCE.m2409"}"#)
                .unwrap();
        match request {
            ClientRequest::SubscribeQuote { ins_list } => {
                assert_eq!(ins_list, "SHFE.rb2410,DCE.m2409");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_peek_message() {
        let request: ClientRequest = serde_json::from_str(r#"{"aid":"peek_message"}"#).unwrap();
        assert!(matches!(request, ClientRequest::PeekMessage));
    }

    #[test]
    fn rejects_unknown_aid_and_garbage() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"aid":"order_insert"}"#).is_err());
        assert!(serde_json::from_str::<ClientRequest>("not json").is_err());
        assert!(serde_json::from_str::<ClientRequest>(r#"{"aid":"subscribe_quote"}"#).is_err());
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(strip_exchange_prefix("SHFE.rb2410"), "rb2410");
        assert_eq!(strip_exchange_prefix("rb2410"), "rb2410");
        assert_eq!(strip_exchange_prefix("A.B.C"), "B.C");
    }

    #[test]
    fn welcome_frame_shape() {
        let frame = serde_json::to_value(WelcomeFrame::new("abc".into(), true)).unwrap();
        assert_eq!(frame["type"], "welcome");
        assert_eq!(frame["session_id"], "abc");
        assert_eq!(frame["ctp_connected"], true);
        assert!(frame["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn subscribe_reply_shape() {
        let reply = serde_json::to_value(SubscribeReply::ok()).unwrap();
        assert_eq!(reply["aid"], "subscribe_quote");
        assert_eq!(reply["status"], "ok");
    }
}
