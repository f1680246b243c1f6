use std::time::Duration;

/// Errors that can occur when driving the Claude CLI.
///
/// Errors are organized by category:
/// - Configuration errors: detected at `build()` time or when a command is built
/// - Spawn errors: failed to start the CLI process
/// - Lifecycle errors: operation not valid in the manager's current state
/// - IO errors: communication failures with the subprocess
/// - Protocol errors: malformed CLI output (strict decoding only)
/// - Runtime errors: the child or a handler failed while a session was running
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // -------------------------------------------------------------------------
    // Configuration errors
    // -------------------------------------------------------------------------
    /// Invalid configuration provided to the builder or to `start()`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // -------------------------------------------------------------------------
    // Spawn errors
    // -------------------------------------------------------------------------
    /// Claude CLI binary not found, or the configured path is unusable.
    #[error("claude CLI not found (searched: {searched})")]
    CliNotFound { searched: String },

    /// Failed to spawn the subprocess.
    #[error("failed to spawn claude process: {0}")]
    ProcessSpawn(#[source] std::io::Error),

    /// The child was spawned but one of its standard streams was not piped.
    #[error("failed to open {stream} pipe to claude process")]
    PipeUnavailable { stream: &'static str },

    // -------------------------------------------------------------------------
    // Lifecycle errors
    // -------------------------------------------------------------------------
    /// `start()` was called while a process is starting, running or stopping.
    #[error("process is already running")]
    AlreadyRunning,

    /// The manager has no live process to talk to.
    #[error("process is not running")]
    NotRunning,

    /// The session client is not connected.
    #[error("client is not connected")]
    NotConnected,

    // -------------------------------------------------------------------------
    // IO errors
    // -------------------------------------------------------------------------
    /// IO error communicating with the claude subprocess.
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    /// A background worker (stdin writer, stdout or stderr reader) hit an OS error.
    #[error("{worker} failed: {source}")]
    Worker {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Protocol errors
    // -------------------------------------------------------------------------
    /// Failed to parse or serialize JSON.
    #[error("failed to parse JSON: {message}")]
    JsonParse {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// A line could not be decoded into a known message (strict decoding).
    #[error("failed to decode message: {message}")]
    MessageParse { message: String, raw: String },

    /// The child's output ended while a turn was still in progress.
    #[error("stream closed unexpectedly")]
    StreamClosed,

    // -------------------------------------------------------------------------
    // Runtime errors
    // -------------------------------------------------------------------------
    /// The persistent process exited while a reader was waiting for output.
    #[error("process terminated unexpectedly ({}): {stderr}", describe_exit(.exit_code))]
    UnexpectedExit {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A one-shot CLI run exited with a non-zero status.
    #[error("CLI exited with {}: {stderr}", describe_exit(.exit_code))]
    CliExit {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Waiting for a turn to complete exceeded the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A message handler rejected a message.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// A message handler panicked while processing a callback.
    #[error("message handler panicked: {0}")]
    HandlerPanicked(String),
}

/// A specialized Result type for claude-duplex operations.
pub type Result<T> = std::result::Result<T, Error>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl Error {
    /// Create a JSON parse error with context.
    pub fn json_parse(source: serde_json::Error, raw: &str) -> Self {
        Self::JsonParse {
            message: format!(
                "at position {}: {}",
                source.column(),
                raw.chars().take(100).collect::<String>()
            ),
            source,
        }
    }

    /// Create an IO error.
    pub fn io(source: std::io::Error) -> Self {
        Self::Io(source)
    }

    /// Create a handler error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Exit code carried by [`Error::UnexpectedExit`] or [`Error::CliExit`].
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::UnexpectedExit { exit_code, .. } | Error::CliExit { exit_code, .. } => {
                *exit_code
            }
            _ => None,
        }
    }

    /// Captured stderr carried by [`Error::UnexpectedExit`] or [`Error::CliExit`].
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::UnexpectedExit { stderr, .. } | Error::CliExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The library never retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Io(_)
                | Error::Worker { .. }
                | Error::UnexpectedExit { .. }
                | Error::StreamClosed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParse {
            message: err.to_string(),
            source: err,
        }
    }
}
