//! Test utilities for claude-duplex integration tests.
//!
//! The tests drive `sh` scripts that stand in for the CLI: they print
//! canned stream-json lines, optionally waiting for a request on stdin
//! first.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use claude_duplex::{AsyncMessageHandler, CommandSpec, Error, Message, MessageHandler, Result};

/// Route tracing output through the test harness (`RUST_LOG` filters it).
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `sh -c <script>`.
pub fn sh(script: impl Into<String>) -> CommandSpec {
    CommandSpec::new(["sh".to_string(), "-c".to_string(), script.into()])
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Async [`wait_until`].
pub async fn wait_until_async(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Builder for realistic stream-json output of one turn.
pub struct ScenarioBuilder {
    lines: Vec<String>,
    session_id: String,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            session_id: "test-session-123".to_string(),
        }
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Add a system init message.
    pub fn system_init(mut self) -> Self {
        self.lines.push(
            json!({
                "type": "system",
                "subtype": "init",
                "cwd": "/tmp",
                "session_id": self.session_id,
                "tools": ["Read", "Write", "Bash"],
                "model": "claude-sonnet-4-20250514",
                "permissionMode": "default",
            })
            .to_string(),
        );
        self
    }

    /// Add an assistant message with one text block.
    pub fn assistant_text(mut self, text: &str) -> Self {
        self.lines.push(
            json!({
                "type": "assistant",
                "message": {
                    "id": "msg_123",
                    "model": "claude-sonnet-4-20250514",
                    "role": "assistant",
                    "content": [{"type": "text", "text": text}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 100, "output_tokens": 25},
                },
                "session_id": self.session_id,
            })
            .to_string(),
        );
        self
    }

    /// Add an assistant tool call followed by its result.
    pub fn tool_round_trip(mut self, tool: &str, output: &str) -> Self {
        self.lines.push(
            json!({
                "type": "assistant",
                "message": {
                    "model": "claude-sonnet-4-20250514",
                    "content": [{"type": "tool_use", "id": "toolu_1", "name": tool, "input": {}}],
                },
                "session_id": self.session_id,
            })
            .to_string(),
        );
        self.lines.push(
            json!({
                "type": "user",
                "message": {
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": "toolu_1", "content": output}],
                },
                "session_id": self.session_id,
            })
            .to_string(),
        );
        self
    }

    /// Add a success result message.
    pub fn success_result(mut self, result_text: &str) -> Self {
        self.lines.push(self.result(false, "success", result_text));
        self
    }

    /// Add an error result message.
    pub fn error_result(mut self, error_message: &str) -> Self {
        self.lines.push(self.result(true, "error_during_execution", error_message));
        self
    }

    /// Add a raw line as-is.
    pub fn raw(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    fn result(&self, is_error: bool, subtype: &str, text: &str) -> String {
        json!({
            "type": "result",
            "subtype": subtype,
            "duration_ms": 1000,
            "duration_api_ms": 800,
            "is_error": is_error,
            "num_turns": 1,
            "session_id": self.session_id,
            "total_cost_usd": 0.001,
            "result": text,
        })
        .to_string()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.clone()
    }

    fn print_all(&self) -> String {
        let quoted: Vec<String> = self.lines.iter().map(|line| shell_quote(line)).collect();
        format!("printf '%s\\n' {}", quoted.join(" "))
    }

    /// A fake one-shot CLI: print every line and exit 0.
    pub fn oneshot(&self) -> CommandSpec {
        sh(self.print_all())
    }

    /// A fake duplex CLI: replay the scenario for every line read on stdin.
    pub fn duplex(&self) -> CommandSpec {
        sh(format!("while IFS= read -r line; do {}; done", self.print_all()))
    }
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One observed handler callback.
#[derive(Debug, Clone)]
pub enum Event {
    QueryStart(String),
    StreamStart,
    Message(Message),
    StreamEnd,
    QueryComplete(usize),
    Error(String),
    /// An [`Error::Handler`] the handler itself returned earlier.
    Rejected(String),
}

/// Which messages a [`RecordingHandler`] should reject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fault {
    #[default]
    None,
    /// Return an error for messages of this kind.
    Fail(&'static str),
    /// Panic for messages of this kind.
    Panic(&'static str),
}

/// Records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    turn: Mutex<Vec<Message>>,
    fault: Fault,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(fault: Fault) -> Self {
        Self {
            fault,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        messages_of(&self.events())
    }

    pub fn errors(&self) -> Vec<String> {
        errors_of(&self.events())
    }

    /// Reasons carried by [`Error::Handler`] values reported back.
    pub fn rejections(&self) -> Vec<String> {
        rejections_of(&self.events())
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl MessageHandler for RecordingHandler {
    fn on_message(&self, message: Message) -> Result<()> {
        let kind = message.kind().to_string();
        self.record(Event::Message(message.clone()));
        self.turn.lock().push(message);
        apply_fault(self.fault, &kind)
    }

    fn on_error(&self, error: &Error) {
        self.record(error_event(error));
    }

    fn on_query_start(&self, prompt: &str) {
        self.turn.lock().clear();
        self.record(Event::QueryStart(prompt.to_string()));
    }

    fn on_query_complete(&self, messages: Vec<Message>) {
        self.record(Event::QueryComplete(messages.len()));
    }

    fn on_stream_start(&self) {
        self.record(Event::StreamStart);
    }

    fn on_stream_end(&self) {
        self.record(Event::StreamEnd);
    }

    fn turn_messages(&self) -> Vec<Message> {
        self.turn.lock().clone()
    }
}

/// Async [`RecordingHandler`].
#[derive(Debug, Default)]
pub struct AsyncRecordingHandler {
    events: Mutex<Vec<Event>>,
    turn: Mutex<Vec<Message>>,
    fault: Fault,
}

impl AsyncRecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(fault: Fault) -> Self {
        Self {
            fault,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        messages_of(&self.events())
    }

    pub fn errors(&self) -> Vec<String> {
        errors_of(&self.events())
    }

    /// Reasons carried by [`Error::Handler`] values reported back.
    pub fn rejections(&self) -> Vec<String> {
        rejections_of(&self.events())
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl AsyncMessageHandler for AsyncRecordingHandler {
    async fn on_message(&self, message: Message) -> Result<()> {
        let kind = message.kind().to_string();
        self.record(Event::Message(message.clone()));
        self.turn.lock().push(message);
        apply_fault(self.fault, &kind)
    }

    async fn on_error(&self, error: &Error) {
        self.record(error_event(error));
    }

    async fn on_query_start(&self, prompt: &str) {
        self.turn.lock().clear();
        self.record(Event::QueryStart(prompt.to_string()));
    }

    async fn on_query_complete(&self, messages: Vec<Message>) {
        self.record(Event::QueryComplete(messages.len()));
    }

    async fn on_stream_start(&self) {
        self.record(Event::StreamStart);
    }

    async fn on_stream_end(&self) {
        self.record(Event::StreamEnd);
    }

    async fn turn_messages(&self) -> Vec<Message> {
        self.turn.lock().clone()
    }
}

fn apply_fault(fault: Fault, kind: &str) -> Result<()> {
    match fault {
        Fault::Fail(target) if target == kind => Err(Error::Handler(format!("rejected {kind}"))),
        Fault::Panic(target) if target == kind => panic!("handler exploded on {kind}"),
        _ => Ok(()),
    }
}

fn messages_of(events: &[Event]) -> Vec<Message> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Message(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn errors_of(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Error(error) | Event::Rejected(error) => Some(error.clone()),
            _ => None,
        })
        .collect()
}

fn rejections_of(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Rejected(reason) => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

fn error_event(error: &Error) -> Event {
    match error {
        Error::Handler(reason) => Event::Rejected(reason.clone()),
        other => Event::Error(other.to_string()),
    }
}

/// Payload with multibyte text and a field over 10KB.
pub fn bulky_payload() -> Value {
    json!({
        "type": "bulk",
        "text": "héllo wörld ✓ 日本語 🦀",
        "blob": "x".repeat(10 * 1024 + 17),
    })
}

/// Count messages of `kind` among `messages`.
pub fn count_kind(messages: &[Message], kind: &str) -> usize {
    messages.iter().filter(|message| message.kind() == kind).count()
}
