//! Outbound envelopes written to the CLI's stdin.

use serde::{Deserialize, Serialize};

/// A request written to the CLI in `--input-format stream-json` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A user turn.
    User {
        message: UserTurnBody,
        session_id: String,
    },
    /// A control request such as an interrupt.
    ControlRequest {
        request_id: String,
        subtype: ControlSubtype,
    },
}

/// Body of an outbound user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTurnBody {
    pub role: String,
    pub content: String,
}

/// Control request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSubtype {
    /// Stop the current turn.
    Interrupt,
}

impl OutboundMessage {
    /// A user turn carrying `prompt` for the given session.
    pub fn user(prompt: impl Into<String>, session_id: impl Into<String>) -> Self {
        OutboundMessage::User {
            message: UserTurnBody {
                role: "user".to_string(),
                content: prompt.into(),
            },
            session_id: session_id.into(),
        }
    }

    /// An interrupt control request.
    pub fn interrupt(request_id: impl Into<String>) -> Self {
        OutboundMessage::ControlRequest {
            request_id: request_id.into(),
            subtype: ControlSubtype::Interrupt,
        }
    }

    /// Request id for control requests.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            OutboundMessage::ControlRequest { request_id, .. } => Some(request_id),
            OutboundMessage::User { .. } => None,
        }
    }
}

/// Fresh control request id: `req_` plus 16 lowercase hex digits.
pub fn new_request_id() -> String {
    format!("req_{:016x}", rand::random::<u64>())
}
