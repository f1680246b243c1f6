//! Thread-model session client.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use super::{
    echo_interrupt, echo_prompt, panic_message, Dispatch, TurnState, ERROR_BACKOFF,
    LISTENER_JOIN_TIMEOUT, LISTENER_POLL_INTERVAL,
};
use crate::config::{ClientConfig, SessionId};
use crate::handler::{DefaultMessageHandler, MessageHandler};
use crate::process::{join_bounded, CommandSpec, PersistentProcess};
use crate::protocol::{Message, OutboundMessage};
use crate::{Error, Result};

/// A multi-turn session with one long-lived CLI process.
///
/// A background listener thread decodes everything the CLI writes and
/// delivers it to the handler `H`. Requests are written from the calling
/// thread. The client disconnects when dropped.
///
/// # Example
///
/// ```no_run
/// use claude_duplex::{ClaudeClient, ClientConfig};
///
/// # fn main() -> claude_duplex::Result<()> {
/// let client = ClaudeClient::new(ClientConfig::default());
/// client.connect()?;
/// for message in client.query("What is 2 + 2?")? {
///     if let Some(assistant) = message.as_assistant() {
///         println!("{}", assistant.text());
///     }
/// }
/// client.disconnect();
/// # Ok(())
/// # }
/// ```
pub struct ClaudeClient<H: MessageHandler = DefaultMessageHandler> {
    shared: Arc<Shared<H>>,
    listener: Mutex<Option<Listener>>,
}

struct Shared<H> {
    config: ClientConfig,
    session_id: SessionId,
    process: PersistentProcess,
    handler: Arc<H>,
    turn: Mutex<TurnState>,
    debug: bool,
}

struct Listener {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ClaudeClient<DefaultMessageHandler> {
    /// Client that buffers each turn in a [`DefaultMessageHandler`].
    pub fn new(config: ClientConfig) -> Self {
        Self::with_handler(config, DefaultMessageHandler::new())
    }

    /// Send `prompt` and wait for the whole turn.
    ///
    /// Waits up to the configured read timeout for the final result and
    /// returns every message of the turn, including a local echo when echo
    /// mode is on. Fails with [`Error::StreamClosed`] if the listener ends
    /// before the turn completes.
    pub fn query(&self, prompt: &str) -> Result<Vec<Message>> {
        self.send_request(prompt)?;

        let handler = &self.shared.handler;
        let timeout = self.shared.config.read_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if handler.wait_for_completion(remaining.min(LISTENER_POLL_INTERVAL)) {
                return Ok(handler.messages());
            }
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            if !self.is_listening() {
                return if handler.is_complete() {
                    Ok(handler.messages())
                } else {
                    Err(Error::StreamClosed)
                };
            }
        }
    }
}

impl<H: MessageHandler> ClaudeClient<H> {
    pub fn with_handler(config: ClientConfig, handler: H) -> Self {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    /// Client whose handler is also held by the caller.
    ///
    /// The session id is taken from the config, or generated when unset.
    pub fn with_shared_handler(config: ClientConfig, handler: Arc<H>) -> Self {
        let session_id = config
            .session_id()
            .cloned()
            .unwrap_or_else(SessionId::generate);
        let config = config.with_session_id(session_id.clone());
        let debug = config.debug();

        Self {
            shared: Arc::new(Shared {
                process: PersistentProcess::with_debug(debug),
                config,
                session_id,
                handler,
                turn: Mutex::new(TurnState::default()),
                debug,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Start the CLI in duplex mode and the listener. No-op when connected.
    pub fn connect(&self) -> Result<()> {
        if self.is_listening() && self.is_connected() {
            return Ok(());
        }
        let command = self.shared.config.persistent_command()?;
        self.connect_with(command)
    }

    /// [`connect`](Self::connect) with an explicit command line.
    ///
    /// A client whose child has exited is restarted.
    pub fn connect_with(&self, command: CommandSpec) -> Result<()> {
        let mut listener = self.listener.lock();
        let listening = listener
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished());
        if listening && self.shared.process.is_alive() {
            return Ok(());
        }

        if let Some(old) = listener.take() {
            retire(old);
        }
        self.shared.process.stop();
        self.shared.turn.lock().finish();

        self.shared.process.start_command(&command)?;

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&stop);
        let spawned = std::thread::Builder::new()
            .name("claude-listener".into())
            .spawn(move || shared.listen(&flag));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.process.stop();
                return Err(Error::Io(e));
            }
        };

        tracing::debug!(session_id = %self.shared.session_id, pid = ?self.pid(), "session connected");
        *listener = Some(Listener { stop, handle });
        Ok(())
    }

    /// Stop the listener and the CLI. Idempotent.
    pub fn disconnect(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            retire(listener);
        }
        self.shared.process.stop();
        self.shared.turn.lock().finish();
        tracing::debug!(session_id = %self.shared.session_id, "session disconnected");
    }

    /// Write one user turn.
    ///
    /// `on_query_start` runs before anything is written, so it always
    /// precedes the turn's messages.
    pub fn send_request(&self, prompt: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let shared = &self.shared;
        shared.handler.on_query_start(prompt);
        shared.turn.lock().begin();
        if shared.config.echo_mode() {
            shared.deliver(echo_prompt(prompt, &shared.session_id));
        }

        let request = OutboundMessage::user(prompt, shared.session_id.as_str());
        if let Err(err) = shared.process.write_request(&request) {
            shared.turn.lock().finish();
            return Err(match err {
                Error::NotRunning => Error::NotConnected,
                other => other,
            });
        }
        Ok(())
    }

    /// Interrupt the current turn. Does nothing when no turn is in progress.
    pub fn interrupt(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let shared = &self.shared;
        {
            let mut turn = shared.turn.lock();
            if !turn.in_progress() {
                return Ok(());
            }
            let request_id = shared.process.write_interrupt()?;
            turn.interrupted();
            tracing::debug!(%request_id, "interrupt sent");
        }

        if shared.config.echo_mode() {
            shared.deliver(echo_interrupt(&shared.session_id));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.process.is_alive()
    }

    /// Recent stderr lines of the CLI.
    pub fn stderr(&self) -> Vec<String> {
        self.shared.process.get_stderr()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.shared.handler
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.process.pid()
    }

    fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }
}

impl<H: MessageHandler> Drop for ClaudeClient<H> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<H: MessageHandler> std::fmt::Debug for ClaudeClient<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeClient")
            .field("session_id", &self.shared.session_id)
            .field("pid", &self.pid())
            .finish()
    }
}

fn retire(listener: Listener) {
    listener.stop.store(true, Ordering::SeqCst);
    // a handler may disconnect from inside a callback
    if listener.handle.thread().id() == std::thread::current().id() {
        return;
    }
    join_bounded("session listener", listener.handle, LISTENER_JOIN_TIMEOUT);
}

impl<H: MessageHandler> Shared<H> {
    fn listen(&self, stop: &Arc<AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            let lines = match self.process.read_lines(LISTENER_POLL_INTERVAL) {
                Ok(lines) => lines.stop_when(Arc::clone(stop)),
                Err(Error::NotRunning) => break,
                Err(err) => {
                    self.report(&err);
                    std::thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            };

            let mut failure = None;
            for line in lines {
                match line {
                    Ok(line) => {
                        if !self.handle_line(&line) {
                            std::thread::sleep(ERROR_BACKOFF);
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            if stop.load(Ordering::SeqCst) {
                break;
            }
            match failure {
                Some(err) => {
                    self.report(&err);
                    if !self.process.is_alive() {
                        self.abandon_turn();
                        break;
                    }
                    std::thread::sleep(ERROR_BACKOFF);
                }
                None => {
                    if self.turn.lock().in_progress() {
                        self.report(&Error::StreamClosed);
                    }
                    self.abandon_turn();
                    break;
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "listener stopped");
    }

    /// Decode and dispatch one line; false when the handler failed.
    fn handle_line(&self, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return true;
        }

        let message = Message::decode(text);
        if self.debug {
            tracing::debug!(kind = message.kind(), "dispatching message");
        }
        let plan = Dispatch::plan(&mut self.turn.lock(), &message);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if plan.stream_start {
                self.handler.on_stream_start();
            }
            let delivered = self.handler.on_message(message);
            if plan.complete {
                if plan.stream_end {
                    self.handler.on_stream_end();
                }
                self.handler.on_query_complete(self.handler.turn_messages());
            }
            delivered
        }));
        self.settle(outcome)
    }

    /// Hand a locally synthesized message to the handler.
    fn deliver(&self, message: Message) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.on_message(message)));
        self.settle(outcome);
    }

    fn settle(&self, outcome: std::thread::Result<Result<()>>) -> bool {
        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err,
            Err(payload) => Error::HandlerPanicked(panic_message(payload.as_ref())),
        };
        self.report(&error);
        false
    }

    fn report(&self, error: &Error) {
        tracing::warn!(session_id = %self.session_id, %error, "session error");
        if catch_unwind(AssertUnwindSafe(|| self.handler.on_error(error))).is_err() {
            tracing::error!(session_id = %self.session_id, "error handler panicked");
        }
    }

    fn abandon_turn(&self) {
        if self.turn.lock().finish() {
            let _ = catch_unwind(AssertUnwindSafe(|| self.handler.on_stream_end()));
        }
    }
}
