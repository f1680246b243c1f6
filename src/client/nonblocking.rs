//! Task-model session client.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    echo_interrupt, echo_prompt, panic_message, Dispatch, TurnState, ERROR_BACKOFF,
    LISTENER_JOIN_TIMEOUT, LISTENER_POLL_INTERVAL,
};
use crate::config::{ClientConfig, SessionId};
use crate::handler::{AsyncDefaultMessageHandler, AsyncMessageHandler};
use crate::process::{AsyncPersistentProcess, CommandSpec};
use crate::protocol::{Message, OutboundMessage};
use crate::{Error, Result};

/// Async multi-turn session with one long-lived CLI process.
///
/// The listener runs as a tokio task and awaits the handler's callbacks in
/// order. Dropping a connected client aborts the listener and kills the
/// CLI without waiting; call [`disconnect`](Self::disconnect) to shut down
/// gracefully.
///
/// ```no_run
/// use claude_duplex::{AsyncClaudeClient, ClientConfig};
///
/// # async fn run() -> claude_duplex::Result<()> {
/// let client = AsyncClaudeClient::new(ClientConfig::default());
/// client.connect().await?;
/// let messages = client.query("Summarize README.md").await?;
/// println!("{} messages", messages.len());
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct AsyncClaudeClient<H: AsyncMessageHandler = AsyncDefaultMessageHandler> {
    shared: Arc<Shared<H>>,
    listener: Mutex<Option<Listener>>,
}

struct Shared<H> {
    config: ClientConfig,
    session_id: SessionId,
    process: AsyncPersistentProcess,
    handler: Arc<H>,
    turn: Mutex<TurnState>,
    debug: bool,
}

struct Listener {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AsyncClaudeClient<AsyncDefaultMessageHandler> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_handler(config, AsyncDefaultMessageHandler::new())
    }

    /// Send `prompt` and wait for the whole turn.
    ///
    /// See [`ClaudeClient::query`](crate::ClaudeClient::query).
    pub async fn query(&self, prompt: &str) -> Result<Vec<Message>> {
        self.send_request(prompt).await?;

        let handler = &self.shared.handler;
        let timeout = self.shared.config.read_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if handler
                .wait_for_completion(remaining.min(LISTENER_POLL_INTERVAL))
                .await
            {
                return Ok(handler.messages().await);
            }
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            if !self.is_listening().await {
                return if handler.is_complete().await {
                    Ok(handler.messages().await)
                } else {
                    Err(Error::StreamClosed)
                };
            }
        }
    }
}

impl<H: AsyncMessageHandler> AsyncClaudeClient<H> {
    pub fn with_handler(config: ClientConfig, handler: H) -> Self {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    pub fn with_shared_handler(config: ClientConfig, handler: Arc<H>) -> Self {
        let session_id = config
            .session_id()
            .cloned()
            .unwrap_or_else(SessionId::generate);
        let config = config.with_session_id(session_id.clone());
        let debug = config.debug();

        Self {
            shared: Arc::new(Shared {
                process: AsyncPersistentProcess::with_debug(debug),
                config,
                session_id,
                handler,
                turn: Mutex::new(TurnState::default()),
                debug,
            }),
            listener: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_listening().await && self.is_connected().await {
            return Ok(());
        }
        let command = self.shared.config.persistent_command()?;
        self.connect_with(command).await
    }

    pub async fn connect_with(&self, command: CommandSpec) -> Result<()> {
        let mut listener = self.listener.lock().await;
        let listening = listener
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished());
        if listening && self.shared.process.is_alive().await {
            return Ok(());
        }

        if let Some(old) = listener.take() {
            retire(old).await;
        }
        self.shared.process.stop().await;
        self.shared.turn.lock().await.finish();

        self.shared.process.start_command(&command).await?;

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.shared).listen(signal));
        tracing::debug!(session_id = %self.shared.session_id, pid = ?self.pid(), "session connected");
        *listener = Some(Listener { shutdown, handle });
        Ok(())
    }

    pub async fn disconnect(&self) {
        let listener = self.listener.lock().await.take();
        if let Some(listener) = listener {
            retire(listener).await;
        }
        self.shared.process.stop().await;
        self.shared.turn.lock().await.finish();
        tracing::debug!(session_id = %self.shared.session_id, "session disconnected");
    }

    /// Write one user turn; `on_query_start` is awaited first.
    pub async fn send_request(&self, prompt: &str) -> Result<()> {
        if !self.is_connected().await {
            return Err(Error::NotConnected);
        }

        let shared = &self.shared;
        shared.handler.on_query_start(prompt).await;
        shared.turn.lock().await.begin();
        if shared.config.echo_mode() {
            shared
                .deliver(echo_prompt(prompt, &shared.session_id))
                .await;
        }

        let request = OutboundMessage::user(prompt, shared.session_id.as_str());
        if let Err(err) = shared.process.write_request(&request).await {
            shared.turn.lock().await.finish();
            return Err(match err {
                Error::NotRunning => Error::NotConnected,
                other => other,
            });
        }
        Ok(())
    }

    /// Interrupt the current turn. Does nothing when no turn is in progress.
    pub async fn interrupt(&self) -> Result<()> {
        if !self.is_connected().await {
            return Err(Error::NotConnected);
        }

        let shared = &self.shared;
        {
            let mut turn = shared.turn.lock().await;
            if !turn.in_progress() {
                return Ok(());
            }
            let request_id = shared.process.write_interrupt().await?;
            turn.interrupted();
            tracing::debug!(%request_id, "interrupt sent");
        }

        if shared.config.echo_mode() {
            shared.deliver(echo_interrupt(&shared.session_id)).await;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.process.is_alive().await
    }

    pub async fn stderr(&self) -> Vec<String> {
        self.shared.process.get_stderr().await
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

    async fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|listener| !listener.handle.is_finished())
    }
}

impl<H: AsyncMessageHandler> Drop for AsyncClaudeClient<H> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            let _ = listener.shutdown.send(true);
            listener.handle.abort();
        }
        self.shared.process.force_kill();
    }
}

impl<H: AsyncMessageHandler> std::fmt::Debug for AsyncClaudeClient<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClaudeClient")
            .field("session_id", &self.shared.session_id)
            .field("pid", &self.pid())
            .finish()
    }
}

async fn retire(mut listener: Listener) {
    let _ = listener.shutdown.send(true);
    // a handler may disconnect from inside a callback
    if tokio::task::try_id() == Some(listener.handle.id()) {
        return;
    }
    if tokio::time::timeout(LISTENER_JOIN_TIMEOUT, &mut listener.handle)
        .await
        .is_err()
    {
        tracing::warn!("session listener did not finish, aborting");
        listener.handle.abort();
    }
}

impl<H: AsyncMessageHandler> Shared<H> {
    async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let stop_requested = *shutdown.borrow();
            if stop_requested {
                break;
            }

            let mut lines = match self.process.read_lines(LISTENER_POLL_INTERVAL).await {
                Ok(lines) => lines,
                Err(Error::NotRunning) => break,
                Err(err) => {
                    self.report(&err).await;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            let mut failure = None;
            let mut stopped = false;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        stopped = true;
                        break;
                    }
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if !self.handle_line(&line).await {
                                tokio::time::sleep(ERROR_BACKOFF).await;
                            }
                        }
                        Some(Err(err)) => {
                            failure = Some(err);
                            break;
                        }
                        None => break,
                    },
                }
            }
            drop(lines);

            if stopped {
                break;
            }
            match failure {
                Some(err) => {
                    self.report(&err).await;
                    if !self.process.is_alive().await {
                        self.abandon_turn().await;
                        break;
                    }
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
                None => {
                    if self.turn.lock().await.in_progress() {
                        self.report(&Error::StreamClosed).await;
                    }
                    self.abandon_turn().await;
                    break;
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "listener stopped");
    }

    async fn handle_line(&self, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return true;
        }

        let message = Message::decode(text);
        if self.debug {
            tracing::debug!(kind = message.kind(), "dispatching message");
        }
        let plan = Dispatch::plan(&mut *self.turn.lock().await, &message);

        let outcome = AssertUnwindSafe(async {
            if plan.stream_start {
                self.handler.on_stream_start().await;
            }
            let delivered = self.handler.on_message(message).await;
            if plan.complete {
                if plan.stream_end {
                    self.handler.on_stream_end().await;
                }
                let messages = self.handler.turn_messages().await;
                self.handler.on_query_complete(messages).await;
            }
            delivered
        })
        .catch_unwind()
        .await;
        self.settle(outcome).await
    }

    async fn deliver(&self, message: Message) {
        let outcome = AssertUnwindSafe(self.handler.on_message(message))
            .catch_unwind()
            .await;
        self.settle(outcome).await;
    }

    async fn settle(&self, outcome: std::thread::Result<Result<()>>) -> bool {
        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => err,
            Err(payload) => Error::HandlerPanicked(panic_message(payload.as_ref())),
        };
        self.report(&error).await;
        false
    }

    async fn report(&self, error: &Error) {
        tracing::warn!(session_id = %self.session_id, %error, "session error");
        if AssertUnwindSafe(self.handler.on_error(error))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(session_id = %self.session_id, "error handler panicked");
        }
    }

    async fn abandon_turn(&self) {
        let was_streaming = self.turn.lock().await.finish();
        if was_streaming {
            let _ = AssertUnwindSafe(self.handler.on_stream_end())
                .catch_unwind()
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_client_rejects_requests() {
        let client = AsyncClaudeClient::new(ClientConfig::default());
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.send_request("hi").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.interrupt().await, Err(Error::NotConnected)));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn session_id_is_pinned_into_config() {
        let client = AsyncClaudeClient::new(ClientConfig::default());
        assert_eq!(client.config().session_id(), Some(client.session_id()));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn query_fails_when_child_exits_mid_turn() {
        let client = AsyncClaudeClient::new(ClientConfig::default());
        client
            .connect_with(CommandSpec::new(["sh", "-c", "read line; exit 0"]))
            .await
            .unwrap();
        assert!(matches!(client.query("hi").await, Err(Error::StreamClosed)));
        assert!(client.handler().last_error().await.is_some());
    }
}
