//! Decoded CLI message types and the line decoder.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::content::{lenient_blocks, ContentBlock, ToolUseBlock};
use super::usage::Usage;
use crate::{Error, Result};

/// A message read from the Claude CLI stream-json output.
///
/// The CLI writes one JSON object per line; its `type` field selects the
/// variant. Anything that cannot be mapped to a known variant is preserved
/// as [`Message::Unknown`] rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// User turn, either echoed locally or replayed by the CLI (tool results).
    User(UserMessage),
    /// Assistant response.
    Assistant(AssistantMessage),
    /// System/status message such as the session `init`.
    System(SystemMessage),
    /// Final result that ends a turn.
    Result(ResultMessage),
    /// Partial streaming delta (`--include-partial-messages`).
    StreamEvent(StreamEventMessage),
    /// Acknowledgement of a control request.
    ControlResponse(ControlResponse),
    /// Anything the decoder did not recognize, with the original payload.
    Unknown(UnknownMessage),
}

/// User message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    /// The message body.
    pub message: UserMessageContent,
    /// Session identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unique message id assigned by the CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Set when this message belongs to a sub-agent tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    /// Structured tool output attached by the CLI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
}

/// Body of a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageContent {
    /// Role (always "user").
    #[serde(default = "user_role")]
    pub role: String,
    /// Plain text or content blocks.
    pub content: UserContent,
}

fn user_role() -> String {
    "user".to_string()
}

/// User content is either a plain string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain prompt text.
    Text(String),
    /// Typed content blocks (tool results, echoed prompts, interrupts).
    #[serde(deserialize_with = "lenient_blocks")]
    Blocks(Vec<ContentBlock>),
}

impl UserMessage {
    /// Build a user message carrying the given blocks.
    pub fn from_blocks(blocks: Vec<ContentBlock>, session_id: Option<String>) -> Self {
        Self {
            message: UserMessageContent {
                role: user_role(),
                content: UserContent::Blocks(blocks),
            },
            session_id,
            uuid: None,
            parent_tool_use_id: None,
            tool_use_result: None,
        }
    }

    /// Content blocks, or an empty slice for plain text content.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.message.content {
            UserContent::Blocks(blocks) => blocks,
            UserContent::Text(_) => &[],
        }
    }

    /// Text content: the plain string, or all text blocks concatenated.
    pub fn text(&self) -> String {
        match &self.message.content {
            UserContent::Text(text) => text.clone(),
            UserContent::Blocks(blocks) => blocks.iter().filter_map(ContentBlock::as_text).collect(),
        }
    }

    /// Check if this message carries an interrupt marker.
    pub fn is_interrupt(&self) -> bool {
        self.blocks().iter().any(ContentBlock::is_interrupt)
    }
}

/// Assistant response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// The message body.
    pub message: AssistantMessageContent,
    /// Session identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Set when this message belongs to a sub-agent tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    /// API error reported for this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessageContent {
    /// Message ID.
    #[serde(default)]
    pub id: Option<String>,
    /// Model that produced the message.
    pub model: String,
    /// Role (always "assistant").
    #[serde(default = "assistant_role")]
    pub role: String,
    /// Content blocks.
    #[serde(deserialize_with = "lenient_blocks")]
    pub content: Vec<ContentBlock>,
    /// Reason the message stopped.
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Raw token usage for this message.
    #[serde(default)]
    pub usage: Option<Value>,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl AssistantMessage {
    /// Get all text content concatenated.
    pub fn text(&self) -> String {
        self.message
            .content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect()
    }

    /// Get all tool use blocks.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.message
            .content
            .iter()
            .filter_map(ContentBlock::as_tool_use)
            .collect()
    }

    /// Token usage, if present and well formed.
    pub fn usage(&self) -> Option<Usage> {
        parse_usage(self.message.usage.as_ref())
    }
}

/// System message; the full payload is kept in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    /// Subtype, e.g. `init`.
    pub subtype: String,
    /// The complete JSON object.
    pub data: Value,
}

impl SystemMessage {
    /// Check if this is the session init message.
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }

    /// Session identifier reported by the CLI.
    pub fn session_id(&self) -> Option<&str> {
        self.data.get("session_id").and_then(Value::as_str)
    }

    /// Model reported by the CLI.
    pub fn model(&self) -> Option<&str> {
        self.data.get("model").and_then(Value::as_str)
    }
}

/// Final result message with summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Result subtype (`success`, `error_max_turns`, ...).
    pub subtype: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Time spent in API calls in milliseconds.
    pub duration_api_ms: u64,
    /// Whether the turn ended in an error.
    pub is_error: bool,
    /// Number of conversation turns.
    pub num_turns: u32,
    /// Session identifier.
    pub session_id: String,
    /// Total cost in USD.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Raw token usage.
    #[serde(default)]
    pub usage: Option<Value>,
    /// Final text result.
    #[serde(default)]
    pub result: Option<String>,
    /// Output matching `--json-schema`, when requested.
    #[serde(default)]
    pub structured_output: Option<Value>,
}

impl ResultMessage {
    /// Check if this is a success result.
    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }

    /// Get the duration as a std::time::Duration.
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.duration_ms)
    }

    /// Token usage, if present and well formed.
    pub fn usage(&self) -> Option<Usage> {
        parse_usage(self.usage.as_ref())
    }
}

/// Partial streaming event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventMessage {
    /// Event id.
    pub uuid: String,
    /// Session identifier.
    pub session_id: String,
    /// Raw API stream event.
    pub event: Value,
    /// Set when this event belongs to a sub-agent tool call.
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

impl StreamEventMessage {
    /// The API event type, e.g. `content_block_delta`.
    pub fn event_type(&self) -> Option<&str> {
        self.event.get("type").and_then(Value::as_str)
    }

    /// Text of a `text_delta`, if this is one.
    pub fn text_delta(&self) -> Option<&str> {
        let delta = self.event.get("delta")?;
        if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
            return None;
        }
        delta.get("text").and_then(Value::as_str)
    }
}

/// Acknowledgement of a control request, taken from the nested `response`.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    /// Response subtype (`success`, `error`, or `unknown` when absent).
    pub subtype: String,
    /// Id of the request being acknowledged.
    pub request_id: Option<String>,
    /// The nested response object.
    pub response: Value,
}

impl ControlResponse {
    fn from_envelope(envelope: &Value) -> Self {
        let response = envelope
            .get("response")
            .cloned()
            .unwrap_or_else(|| json!({}));
        Self {
            subtype: response
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            request_id: response
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            response,
        }
    }
}

/// A message the decoder could not map to a known variant.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownMessage {
    /// The declared `type`, or a marker such as `invalid_json` / `missing_type`.
    pub kind: String,
    /// The original payload.
    pub raw: Value,
}

struct Rejected {
    unknown: UnknownMessage,
    reason: String,
}

impl Rejected {
    fn new(kind: impl Into<String>, raw: Value, reason: impl Into<String>) -> Self {
        Self {
            unknown: UnknownMessage {
                kind: kind.into(),
                raw,
            },
            reason: reason.into(),
        }
    }
}

impl Message {
    /// Decode one line of CLI output. Never fails.
    ///
    /// Invalid JSON, a missing `type`, an unrecognized `type` or a known type
    /// with missing fields all yield [`Message::Unknown`] carrying the input.
    pub fn decode(line: &str) -> Message {
        Self::classify(line).unwrap_or_else(|rejected| {
            tracing::debug!(
                kind = %rejected.unknown.kind,
                reason = %rejected.reason,
                "decoded unrecognized message"
            );
            Message::Unknown(rejected.unknown)
        })
    }

    /// Decode one line, rejecting anything that is not a known message.
    pub fn decode_strict(line: &str) -> Result<Message> {
        Self::classify(line).map_err(|rejected| Error::MessageParse {
            message: format!("{} ({})", rejected.reason, rejected.unknown.kind),
            raw: line.to_string(),
        })
    }

    /// Decode an already parsed JSON value. Never fails.
    pub fn from_value(value: Value) -> Message {
        Self::classify_value(value).unwrap_or_else(|rejected| Message::Unknown(rejected.unknown))
    }

    fn classify(line: &str) -> std::result::Result<Message, Rejected> {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Self::classify_value(value),
            Err(e) => Err(Rejected::new(
                "invalid_json",
                json!({ "raw_string": line }),
                e.to_string(),
            )),
        }
    }

    fn classify_value(value: Value) -> std::result::Result<Message, Rejected> {
        if !value.is_object() {
            let kind = format!("invalid_type_{}", json_type_name(&value));
            return Err(Rejected::new(
                kind,
                json!({ "raw_data": value }),
                "message is not a JSON object",
            ));
        }

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Err(Rejected::new("missing_type", value, "message has no type")),
        };

        let parsed = match kind.as_str() {
            "user" => UserMessage::deserialize(&value).map(Message::User),
            "assistant" => AssistantMessage::deserialize(&value).map(Message::Assistant),
            "result" => ResultMessage::deserialize(&value).map(Message::Result),
            "stream_event" => StreamEventMessage::deserialize(&value).map(Message::StreamEvent),
            "control_response" => Ok(Message::ControlResponse(ControlResponse::from_envelope(
                &value,
            ))),
            "system" => match value.get("subtype").and_then(Value::as_str) {
                Some(subtype) => Ok(Message::System(SystemMessage {
                    subtype: subtype.to_string(),
                    data: value.clone(),
                })),
                None => return Err(Rejected::new(kind, value, "system message has no subtype")),
            },
            _ => {
                let reason = format!("unrecognized message type `{kind}`");
                return Err(Rejected::new(kind, value, reason));
            }
        };

        parsed.map_err(|e| {
            let reason = e.to_string();
            Rejected::new(kind, value, reason)
        })
    }

    /// The wire `type` of this message (or the unknown marker).
    pub fn kind(&self) -> &str {
        match self {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::System(_) => "system",
            Message::Result(_) => "result",
            Message::StreamEvent(_) => "stream_event",
            Message::ControlResponse(_) => "control_response",
            Message::Unknown(m) => &m.kind,
        }
    }

    /// Get the session ID if present.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::User(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::System(m) => m.session_id(),
            Message::Result(m) => Some(&m.session_id),
            Message::StreamEvent(m) => Some(&m.session_id),
            Message::ControlResponse(_) | Message::Unknown(_) => None,
        }
    }

    /// Check if this is the terminal result of a turn.
    pub fn is_result(&self) -> bool {
        matches!(self, Message::Result(_))
    }

    /// Check if the decoder did not recognize this message.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Message::Unknown(_))
    }

    /// Get as user message.
    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            _ => None,
        }
    }

    /// Get as assistant message.
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }

    /// Get as system message.
    pub fn as_system(&self) -> Option<&SystemMessage> {
        match self {
            Message::System(m) => Some(m),
            _ => None,
        }
    }

    /// Get as result message.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Message::Result(m) => Some(m),
            _ => None,
        }
    }

    /// Get as unknown message.
    pub fn as_unknown(&self) -> Option<&UnknownMessage> {
        match self {
            Message::Unknown(m) => Some(m),
            _ => None,
        }
    }
}

fn parse_usage(raw: Option<&Value>) -> Option<Usage> {
    raw.and_then(|value| Usage::deserialize(value).ok())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
