//! Session clients on top of the persistent process managers.
//!
//! [`ClaudeClient`] runs its listener on a background thread and calls a
//! [`MessageHandler`](crate::MessageHandler); [`AsyncClaudeClient`] runs it
//! as a tokio task and calls an
//! [`AsyncMessageHandler`](crate::AsyncMessageHandler). Both keep one CLI
//! child alive across turns and share the same turn bookkeeping.

mod blocking;
mod nonblocking;

use std::any::Any;
use std::time::Duration;

pub use blocking::ClaudeClient;
pub use nonblocking::AsyncClaudeClient;

use crate::config::SessionId;
use crate::protocol::{ContentBlock, Message, UserMessage};

/// How long one listener read waits before checking for a stop request.
pub const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a listener error before reading again.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How long `disconnect` waits for the listener to finish.
pub const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-turn flags shared by the caller and the listener.
#[derive(Debug, Default)]
pub(crate) struct TurnState {
    in_progress: bool,
    streaming: bool,
}

impl TurnState {
    pub(crate) fn begin(&mut self) {
        self.in_progress = true;
        self.streaming = false;
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Record a child message; true when it is the first of the turn.
    pub(crate) fn observe(&mut self) -> bool {
        if self.in_progress && !self.streaming {
            self.streaming = true;
            return true;
        }
        false
    }

    /// End the turn; true when a stream had started.
    pub(crate) fn finish(&mut self) -> bool {
        let was_streaming = self.streaming;
        self.in_progress = false;
        self.streaming = false;
        was_streaming
    }

    /// Clear the in-progress flag after an interrupt, keeping `streaming`
    /// so the final result still closes the stream.
    pub(crate) fn interrupted(&mut self) {
        self.in_progress = false;
    }
}

/// What the listener does with one decoded message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub(crate) stream_start: bool,
    pub(crate) stream_end: bool,
    pub(crate) complete: bool,
}

impl Dispatch {
    pub(crate) fn plan(turn: &mut TurnState, message: &Message) -> Self {
        let stream_start = turn.observe();
        if message.is_result() {
            let stream_end = turn.finish();
            Dispatch {
                stream_start,
                stream_end,
                complete: true,
            }
        } else {
            Dispatch {
                stream_start,
                stream_end: false,
                complete: false,
            }
        }
    }
}

pub(crate) fn echo_prompt(prompt: &str, session_id: &SessionId) -> Message {
    Message::User(UserMessage::from_blocks(
        vec![ContentBlock::text(prompt)],
        Some(session_id.to_string()),
    ))
}

pub(crate) fn echo_interrupt(session_id: &SessionId) -> Message {
    Message::User(UserMessage::from_blocks(
        vec![ContentBlock::Interrupt],
        Some(session_id.to_string()),
    ))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
