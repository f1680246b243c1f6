//! JSON protocol types for the Claude CLI stream-json mode.
//!
//! # Inbound
//!
//! The CLI writes newline-delimited JSON. [`Message::decode`] turns one line
//! into a [`Message`] and never fails: anything it cannot map lands in
//! [`Message::Unknown`] with the original payload. [`Message::decode_strict`]
//! reports the same cases as [`crate::Error::MessageParse`] instead.
//!
//! # Outbound
//!
//! [`OutboundMessage`] covers the two envelopes written to the CLI's stdin:
//! user turns and interrupt control requests.
//!
//! # Example
//!
//! ```
//! use claude_duplex::protocol::Message;
//!
//! let line = r#"{"type": "assistant", "message": {"model": "claude-sonnet-4", "content": [{"type": "text", "text": "Hello!"}]}}"#;
//! if let Some(assistant) = Message::decode(line).as_assistant() {
//!     assert_eq!(assistant.text(), "Hello!");
//! }
//!
//! assert!(Message::decode("not json").is_unknown());
//! ```

mod content;
mod messages;
mod requests;
mod usage;

pub use content::{
    ContentBlock, TextBlock, ThinkingBlock, ToolResultBlock, ToolResultContent, ToolUseBlock,
};
pub use messages::{
    AssistantMessage, AssistantMessageContent, ControlResponse, Message, ResultMessage,
    StreamEventMessage, SystemMessage, UnknownMessage, UserContent, UserMessage,
    UserMessageContent,
};
pub use requests::{new_request_id, ControlSubtype, OutboundMessage, UserTurnBody};
pub use usage::Usage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Message>();
        assert_send_sync::<ContentBlock>();
        assert_send_sync::<OutboundMessage>();
        assert_send_sync::<Usage>();
    }

    #[test]
    fn echoed_user_turn_decodes_back() {
        let line = serde_json::to_string(&OutboundMessage::user("ping", "s-1")).unwrap();
        let msg = Message::decode(&line);
        let user = msg.as_user().unwrap();
        assert_eq!(user.text(), "ping");
        assert_eq!(msg.session_id(), Some("s-1"));
    }

    #[test]
    fn interrupt_request_decodes_as_unknown() {
        let line = serde_json::to_string(&OutboundMessage::interrupt(new_request_id())).unwrap();
        let msg = Message::decode(&line);
        assert_eq!(msg.kind(), "control_request");
        assert_eq!(msg.as_unknown().unwrap().raw["subtype"], "interrupt");
    }
}
