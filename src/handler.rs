//! Message handlers for the session clients.
//!
//! A session client runs a listener that decodes every line the CLI writes
//! and pushes the resulting [`Message`] into a handler. Implement
//! [`MessageHandler`] (thread model) or [`AsyncMessageHandler`] (task model)
//! to react to messages as they arrive. Every callback except `on_message`
//! has a default.
//!
//! # Callback order for one turn
//!
//! 1. `on_query_start(prompt)`, before the request is written
//! 2. `on_stream_start()`, on the first message of the turn
//! 3. `on_message(message)`, once per message, in arrival order
//! 4. `on_stream_end()`, then `on_query_complete(turn_messages())` after the
//!    final result
//!
//! `on_error` may fire at any point, including for errors that are not tied
//! to a turn.
//!
//! # Example
//!
//! ```
//! use claude_duplex::{Message, MessageHandler, Result};
//!
//! struct Printer;
//!
//! impl MessageHandler for Printer {
//!     fn on_message(&self, message: Message) -> Result<()> {
//!         if let Some(assistant) = message.as_assistant() {
//!             print!("{}", assistant.text());
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Callbacks driven by [`ClaudeClient`](crate::ClaudeClient)'s listener thread.
///
/// Callbacks run on the listener thread, so a slow callback delays every
/// later message. An `Err` from `on_message` or a panic in any callback is
/// reported through `on_error` and the listener keeps going.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message) -> Result<()>;

    fn on_error(&self, error: &Error) {
        tracing::error!(%error, "session error");
    }

    fn on_query_start(&self, prompt: &str) {
        let _ = prompt;
    }

    fn on_query_complete(&self, messages: Vec<Message>) {
        let _ = messages;
    }

    fn on_stream_start(&self) {}

    fn on_stream_end(&self) {}

    /// Messages accumulated for the current turn, handed to
    /// `on_query_complete`. Handlers that do not buffer return nothing.
    fn turn_messages(&self) -> Vec<Message> {
        Vec::new()
    }
}

/// Task-model counterpart of [`MessageHandler`], driven by
/// [`AsyncClaudeClient`](crate::AsyncClaudeClient).
#[async_trait]
pub trait AsyncMessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: Message) -> Result<()>;

    async fn on_error(&self, error: &Error) {
        tracing::error!(%error, "session error");
    }

    async fn on_query_start(&self, prompt: &str) {
        let _ = prompt;
    }

    async fn on_query_complete(&self, messages: Vec<Message>) {
        let _ = messages;
    }

    async fn on_stream_start(&self) {}

    async fn on_stream_end(&self) {}

    async fn turn_messages(&self) -> Vec<Message> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct TurnBuffer {
    messages: Vec<Message>,
    prompt: Option<String>,
    started: bool,
    complete: bool,
    streaming: bool,
    last_error: Option<String>,
}

impl TurnBuffer {
    fn reset(&mut self, prompt: &str) {
        self.messages.clear();
        self.prompt = Some(prompt.to_string());
        self.started = true;
        self.complete = false;
        self.streaming = false;
    }
}

/// Buffers the messages of the current turn.
///
/// Used by [`ClaudeClient::query`](crate::ClaudeClient::query) to collect a
/// whole turn. Starting a new query discards the previous turn's messages.
#[derive(Debug, Default)]
pub struct DefaultMessageHandler {
    state: Mutex<TurnBuffer>,
    completed: Condvar,
}

impl DefaultMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages buffered for the current turn.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Prompt of the current turn.
    pub fn prompt(&self) -> Option<String> {
        self.state.lock().prompt.clone()
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.started && state.complete
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Description of the most recent error reported to this handler.
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Block until the current turn completes.
    ///
    /// Returns `false` on timeout or when no query has been started.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.started {
            return false;
        }
        let deadline = std::time::Instant::now() + timeout;
        while !state.complete {
            if self.completed.wait_until(&mut state, deadline).timed_out() {
                return state.complete;
            }
        }
        true
    }
}

impl MessageHandler for DefaultMessageHandler {
    fn on_message(&self, message: Message) -> Result<()> {
        self.state.lock().messages.push(message);
        Ok(())
    }

    fn on_error(&self, error: &Error) {
        tracing::debug!(%error, "buffered handler received error");
        self.state.lock().last_error = Some(error.to_string());
    }

    fn on_query_start(&self, prompt: &str) {
        self.state.lock().reset(prompt);
    }

    fn on_query_complete(&self, _messages: Vec<Message>) {
        let mut state = self.state.lock();
        if state.started {
            state.complete = true;
            self.completed.notify_all();
        }
    }

    fn on_stream_start(&self) {
        self.state.lock().streaming = true;
    }

    fn on_stream_end(&self) {
        self.state.lock().streaming = false;
    }

    fn turn_messages(&self) -> Vec<Message> {
        self.messages()
    }
}

/// Task-model [`DefaultMessageHandler`].
#[derive(Debug)]
pub struct AsyncDefaultMessageHandler {
    state: tokio::sync::Mutex<TurnBuffer>,
    completed: watch::Sender<bool>,
}

impl Default for AsyncDefaultMessageHandler {
    fn default() -> Self {
        Self {
            state: tokio::sync::Mutex::new(TurnBuffer::default()),
            completed: watch::channel(false).0,
        }
    }
}

impl AsyncDefaultMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    pub async fn prompt(&self) -> Option<String> {
        self.state.lock().await.prompt.clone()
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        state.started && state.complete
    }

    pub async fn is_streaming(&self) -> bool {
        self.state.lock().await.streaming
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    /// Wait until the current turn completes.
    ///
    /// Returns `false` on timeout or when no query has been started.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        if !self.state.lock().await.started {
            return false;
        }
        let mut completed = self.completed.subscribe();
        let done = matches!(
            tokio::time::timeout(timeout, completed.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }
}

#[async_trait]
impl AsyncMessageHandler for AsyncDefaultMessageHandler {
    async fn on_message(&self, message: Message) -> Result<()> {
        self.state.lock().await.messages.push(message);
        Ok(())
    }

    async fn on_error(&self, error: &Error) {
        tracing::debug!(%error, "buffered handler received error");
        self.state.lock().await.last_error = Some(error.to_string());
    }

    async fn on_query_start(&self, prompt: &str) {
        let mut state = self.state.lock().await;
        state.reset(prompt);
        self.completed.send_replace(false);
    }

    async fn on_query_complete(&self, _messages: Vec<Message>) {
        let mut state = self.state.lock().await;
        if state.started {
            state.complete = true;
            self.completed.send_replace(true);
        }
    }

    async fn on_stream_start(&self) {
        self.state.lock().await.streaming = true;
    }

    async fn on_stream_end(&self) {
        self.state.lock().await.streaming = false;
    }

    async fn turn_messages(&self) -> Vec<Message> {
        self.messages().await
    }
}
