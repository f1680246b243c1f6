//! One-shot queries: run the CLI in print mode for a single prompt.
//!
//! Each call spawns a fresh CLI process, streams its decoded messages and
//! ends after the final result. Use a session client to keep context
//! across turns.
//!
//! ```no_run
//! use claude_duplex::{query_text, ClientConfig};
//!
//! # fn main() -> claude_duplex::Result<()> {
//! let answer = query_text("What is 2 + 2?", &ClientConfig::default())?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

use futures::Stream;

use crate::config::ClientConfig;
use crate::process::{execute, execute_async, AsyncRawLines, CommandSpec, RawLines};
use crate::protocol::Message;
use crate::Result;

/// Run `prompt` once and iterate the CLI's messages.
pub fn query(prompt: &str, config: &ClientConfig) -> Result<QueryMessages> {
    query_command(&config.oneshot_command(prompt)?)
}

/// Run a prepared command and iterate its messages.
pub fn query_command(command: &CommandSpec) -> Result<QueryMessages> {
    let lines = execute(&command.argv, &command.options)?;
    Ok(QueryMessages {
        lines,
        finished: false,
    })
}

/// Run `prompt` once and return all assistant text.
pub fn query_text(prompt: &str, config: &ClientConfig) -> Result<String> {
    let mut text = String::new();
    for message in query(prompt, config)? {
        if let Some(assistant) = message?.as_assistant() {
            text.push_str(&assistant.text());
        }
    }
    Ok(text)
}

/// Messages of a one-shot run, ending after the final result.
///
/// A non-zero CLI exit surfaces as a final [`Error::CliExit`](crate::Error::CliExit).
#[derive(Debug)]
pub struct QueryMessages {
    lines: RawLines,
    finished: bool,
}

impl Iterator for QueryMessages {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            if let Some(message) = decode_line(&line) {
                self.finished = message.is_result();
                return Some(Ok(message));
            }
        }
    }
}

/// Async [`query`].
pub async fn async_query(prompt: &str, config: &ClientConfig) -> Result<AsyncQueryMessages> {
    async_query_command(&config.oneshot_command(prompt)?).await
}

/// Async [`query_command`].
pub async fn async_query_command(command: &CommandSpec) -> Result<AsyncQueryMessages> {
    let lines = execute_async(&command.argv, &command.options).await?;
    Ok(AsyncQueryMessages {
        lines,
        finished: false,
    })
}

/// Async [`query_text`].
pub async fn async_query_text(prompt: &str, config: &ClientConfig) -> Result<String> {
    let mut messages = async_query(prompt, config).await?;
    let mut text = String::new();
    while let Some(message) = messages.next().await {
        if let Some(assistant) = message?.as_assistant() {
            text.push_str(&assistant.text());
        }
    }
    Ok(text)
}

/// Messages of an async one-shot run.
#[derive(Debug)]
pub struct AsyncQueryMessages {
    lines: AsyncRawLines,
    finished: bool,
}

impl AsyncQueryMessages {
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.lines.next().await? {
                Ok(line) => line,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            if let Some(message) = decode_line(&line) {
                self.finished = message.is_result();
                return Some(Ok(message));
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> + Send {
        futures::stream::unfold(self, |mut messages| async move {
            let item = messages.next().await?;
            Some((item, messages))
        })
    }
}

fn decode_line(line: &[u8]) -> Option<Message> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let message = Message::decode(text);
    if let Some(result) = message.as_result() {
        if result.is_error {
            tracing::warn!(
                subtype = %result.subtype,
                result = result.result.as_deref().unwrap_or_default(),
                "query finished with an error result"
            );
        }
    }
    Some(message)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::Error;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    const ASSISTANT: &str = r#"{"type":"assistant","message":{"model":"m","content":[{"type":"text","text":"Hello"}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","duration_ms":1,"duration_api_ms":1,"is_error":false,"num_turns":1,"session_id":"s"}"#;

    fn script(lines: &[&str], tail: &str) -> CommandSpec {
        let mut body = String::new();
        for line in lines {
            body.push_str(&format!("printf '%s\\n' '{line}'; "));
        }
        body.push_str(tail);
        CommandSpec::new(["sh".to_string(), "-c".to_string(), body])
    }

    #[test]
    fn stops_after_result_and_skips_blank_lines() {
        let command = script(&[ASSISTANT, "", RESULT, ASSISTANT], "");
        let kinds: Vec<String> = query_command(&command)
            .unwrap()
            .map(|message| message.unwrap().kind().to_string())
            .collect();
        assert_eq!(kinds, vec!["assistant", "result"]);
    }

    #[test]
    fn garbage_lines_become_unknown() {
        let command = script(&["not json", RESULT], "");
        let messages: Vec<Message> = query_command(&command)
            .unwrap()
            .map(|message| message.unwrap())
            .collect();
        assert!(messages[0].is_unknown());
        assert!(messages[1].is_result());
    }

    #[test]
    fn failing_cli_reports_exit() {
        let command = script(&[ASSISTANT], "echo 'auth failed' >&2; exit 1");
        let mut messages = query_command(&command).unwrap();
        assert!(messages.next().unwrap().is_ok());
        let err = messages.next().unwrap().unwrap_err();
        assert!(matches!(err, Error::CliExit { .. }));
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.stderr(), Some("auth failed"));
        assert!(messages.next().is_none());
    }

    #[tokio::test]
    async fn async_stream_collects_messages() {
        let command = script(&[ASSISTANT, RESULT], "");
        let messages: Vec<Message> = async_query_command(&command)
            .await
            .unwrap()
            .into_stream()
            .map(|message| message.unwrap())
            .collect()
            .await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_assistant().unwrap().text(), "Hello");
    }
}
