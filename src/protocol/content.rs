//! Content block types for messages.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A content block within a user or assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text content.
    Text(TextBlock),
    /// Extended thinking output.
    Thinking(ThinkingBlock),
    /// A tool use request from the assistant.
    ToolUse(ToolUseBlock),
    /// A tool result returned to the assistant.
    ToolResult(ToolResultBlock),
    /// Marker for an interrupted turn.
    Interrupt,
}

/// Plain text content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// The text content.
    pub text: String,
}

/// Thinking block for extended thinking feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// The thinking text (may be redacted).
    pub thinking: String,
    /// Signature the API uses to verify the thinking block.
    pub signature: String,
}

/// A tool use request from the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Unique identifier for this tool use.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// Input parameters as JSON object.
    pub input: Value,
}

/// A tool result returned to the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// ID of the tool_use this result corresponds to.
    pub tool_use_id: String,
    /// The result content, a string or a list of structured blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ToolResultContent>,
    /// Whether the tool execution resulted in an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Content of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Simple string result.
    Text(String),
    /// Structured result blocks, kept as raw JSON.
    Blocks(Vec<Value>),
}

impl ToolResultContent {
    /// Get the content as a string (joins the `text` of structured blocks).
    pub fn as_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ContentBlock {
    /// Block `type` tags this crate understands.
    pub const KNOWN_TYPES: [&'static str; 5] =
        ["text", "thinking", "tool_use", "tool_result", "interrupt"];

    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock { text: text.into() })
    }

    /// Check if this is a text block.
    pub fn is_text(&self) -> bool {
        matches!(self, ContentBlock::Text(_))
    }

    /// Check if this is an interrupt marker.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, ContentBlock::Interrupt)
    }

    /// Get the text if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(t) => Some(&t.text),
            _ => None,
        }
    }

    /// Get as tool use block if applicable.
    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            ContentBlock::ToolUse(t) => Some(t),
            _ => None,
        }
    }

    /// Get as tool result block if applicable.
    pub fn as_tool_result(&self) -> Option<&ToolResultBlock> {
        match self {
            ContentBlock::ToolResult(t) => Some(t),
            _ => None,
        }
    }
}

/// Deserialize a block list, skipping blocks whose `type` is not recognized.
///
/// A block without a string `type` fails the whole list.
pub(crate) fn lenient_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    let mut blocks = Vec::with_capacity(raw.len());
    for value in raw {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(D::Error::custom("content block is missing its type"));
        };
        if !ContentBlock::KNOWN_TYPES.contains(&kind) {
            tracing::trace!(block_type = kind, "skipping unrecognized content block");
            continue;
        }
        blocks.push(serde_json::from_value(value).map_err(D::Error::custom)?);
    }
    Ok(blocks)
}
