//! JSON frames exchanged with visitor websockets.
//!
//! ```text
//! server -> visitor  {"type":"connected-ack","token":"abc123","timestamp":"..."}
//! visitor -> server  {"type":"ping"}
//! server -> visitor  {"type":"pong","timestamp":"..."}
//! server -> visitor  {"type":"operator-reply","message":"Hello Ann","timestamp":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::{CorrelationToken, now_rfc3339};

#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct FrameError(#[from] serde_json::Error);

/// Frames the relay sends to a visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VisitorFrame {
    ConnectedAck {
        token: CorrelationToken,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    OperatorReply {
        message: String,
        timestamp: String,
    },
}

impl VisitorFrame {
    pub fn connected_ack(token: CorrelationToken) -> Self {
        Self::ConnectedAck {
            token,
            timestamp: now_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_rfc3339(),
        }
    }

    pub fn operator_reply(message: impl Into<String>) -> Self {
        Self::OperatorReply {
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectedAck { .. } => "connected-ack",
            Self::Pong { .. } => "pong",
            Self::OperatorReply { .. } => "operator-reply",
        }
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames a visitor may send. Unknown `type` values parse as [`ClientFrame::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Ping,
    #[serde(other)]
    Other,
}

impl ClientFrame {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn connected_ack_carries_token_and_timestamp() {
        let token = CorrelationToken::parse("abc123").unwrap();
        let raw = VisitorFrame::connected_ack(token).to_json().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "connected-ack");
        assert_eq!(value["token"], "abc123");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn operator_reply_uses_message_field() {
        let frame = VisitorFrame::operator_reply("Hello Ann");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "operator-reply");
        assert_eq!(value["message"], "Hello Ann");
        assert_eq!(frame.kind(), "operator-reply");
    }

    #[test]
    fn pong_has_only_type_and_timestamp() {
        let value = serde_json::to_value(VisitorFrame::pong()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["type"], json!("pong"));
    }

    #[test]
    fn client_ping_parses() {
        assert_eq!(ClientFrame::parse(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn unknown_client_type_is_other() {
        let frame = ClientFrame::parse(r#"{"type":"typing","text":"h"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Other);
    }

    #[test]
    fn malformed_client_frames_fail() {
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"kind":"ping"}"#).is_err());
        assert!(ClientFrame::parse("[1,2]").is_err());
    }
}
