//! Run-to-completion execution: spawn, stream stdout, report the exit.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::Stream;
use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;

use super::{
    join_bounded, spawn_error, std_command, terminate_async, terminate_blocking, trim_line_ending,
    SpawnOptions, StderrBuffer, PROCESS_WAIT_TIMEOUT, THREAD_JOIN_TIMEOUT,
};
use crate::{Error, Result};

/// Spawn `argv` with stdin closed and iterate its stdout lines.
///
/// The iterator ends after the last line when the process exits with code
/// 0. A non-zero exit yields a final [`Error::CliExit`] carrying the exit
/// code and captured stderr.
///
/// ```no_run
/// # fn main() -> claude_duplex::Result<()> {
/// use claude_duplex::process::{execute, SpawnOptions};
///
/// let argv = ["echo".to_string(), "hi".to_string()];
/// for line in execute(&argv, &SpawnOptions::default())? {
///     println!("{}", String::from_utf8_lossy(&line?));
/// }
/// # Ok(())
/// # }
/// ```
pub fn execute(argv: &[String], options: &SpawnOptions) -> Result<RawLines> {
    let mut command = std_command(argv, options)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| spawn_error(&argv[0], e))?;
    let pid = child.id();

    let (Some(stdout), Some(stderr_pipe)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(Error::PipeUnavailable {
            stream: "stdout/stderr",
        });
    };

    let stderr = Arc::new(Mutex::new(StderrBuffer::new()));
    let collector = Arc::clone(&stderr);
    let stderr_worker = std::thread::Builder::new()
        .name(format!("claude-oneshot-stderr-{pid}"))
        .spawn(move || {
            for line in BufReader::new(stderr_pipe).split(b'\n') {
                let Ok(raw) = line else { break };
                let text = String::from_utf8_lossy(&raw);
                let text = text.trim();
                if !text.is_empty() {
                    collector.lock().push(text.to_string());
                }
            }
        });

    let child = Mutex::new(child);
    let stderr_worker = match stderr_worker {
        Ok(handle) => handle,
        Err(e) => {
            terminate_blocking(&child, pid, std::time::Duration::ZERO);
            return Err(Error::Io(e));
        }
    };

    tracing::debug!(pid, program = %argv[0], "started one-shot process");
    Ok(RawLines {
        child,
        pid,
        stdout: BufReader::new(stdout),
        stderr,
        stderr_worker: Some(stderr_worker),
        done: false,
        reaped: false,
    })
}

/// Stdout lines of a one-shot run.
///
/// Dropping it before the end terminates the process.
pub struct RawLines {
    child: Mutex<Child>,
    pid: u32,
    stdout: BufReader<ChildStdout>,
    stderr: Arc<Mutex<StderrBuffer>>,
    stderr_worker: Option<JoinHandle<()>>,
    done: bool,
    reaped: bool,
}

impl RawLines {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stderr lines captured so far.
    pub fn stderr(&self) -> Vec<String> {
        self.stderr.lock().snapshot()
    }

    fn finish(&mut self) -> Option<Result<Vec<u8>>> {
        self.done = true;
        let status = self.child.get_mut().wait();
        self.reaped = true;
        if let Some(worker) = self.stderr_worker.take() {
            join_bounded("one-shot stderr", worker, THREAD_JOIN_TIMEOUT);
        }

        match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(Error::CliExit {
                exit_code: status.code(),
                stderr: self.stderr.lock().joined(),
            })),
            Err(e) => Some(Err(Error::Io(e))),
        }
    }
}

impl Iterator for RawLines {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut line = Vec::new();
        match self.stdout.read_until(b'\n', &mut line) {
            Ok(0) => self.finish(),
            Ok(_) => {
                trim_line_ending(&mut line);
                Some(Ok(line))
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::Io(e)))
            }
        }
    }
}

impl Drop for RawLines {
    fn drop(&mut self) {
        if !self.reaped {
            terminate_blocking(&self.child, self.pid, PROCESS_WAIT_TIMEOUT);
        }
    }
}

impl std::fmt::Debug for RawLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawLines")
            .field("pid", &self.pid)
            .field("done", &self.done)
            .finish()
    }
}

/// Async [`execute`].
pub async fn execute_async(argv: &[String], options: &SpawnOptions) -> Result<AsyncRawLines> {
    let mut command = tokio::process::Command::from(std_command(argv, options)?);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| spawn_error(&argv[0], e))?;
    let pid = child.id();

    let (Some(stdout), Some(stderr_pipe)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(Error::PipeUnavailable {
            stream: "stdout/stderr",
        });
    };

    let stderr = Arc::new(tokio::sync::Mutex::new(StderrBuffer::new()));
    let collector = Arc::clone(&stderr);
    let stderr_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr_pipe).split(b'\n');
        while let Ok(Some(raw)) = lines.next_segment().await {
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim();
            if !text.is_empty() {
                collector.lock().await.push(text.to_string());
            }
        }
    });

    tracing::debug!(?pid, program = %argv[0], "started one-shot process");
    Ok(AsyncRawLines {
        child: Arc::new(tokio::sync::Mutex::new(child)),
        pid,
        stdout: tokio::io::BufReader::new(stdout),
        pending: Vec::new(),
        stderr,
        stderr_task: Some(stderr_task),
        done: false,
        reaped: false,
    })
}

/// Stdout lines of an async one-shot run.
///
/// `next()` is cancel safe. Dropping it before the end terminates the
/// process in the background.
pub struct AsyncRawLines {
    child: Arc<tokio::sync::Mutex<tokio::process::Child>>,
    pid: Option<u32>,
    stdout: tokio::io::BufReader<tokio::process::ChildStdout>,
    pending: Vec<u8>,
    stderr: Arc<tokio::sync::Mutex<StderrBuffer>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    done: bool,
    reaped: bool,
}

impl AsyncRawLines {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stderr lines captured so far.
    pub async fn stderr(&self) -> Vec<String> {
        self.stderr.lock().await.snapshot()
    }

    /// Next line, `None` after a clean exit, or the failure that ended the run.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        if self.done {
            return None;
        }

        loop {
            let available = match self.stdout.fill_buf().await {
                Ok(buf) => buf,
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::Io(e)));
                }
            };

            if available.is_empty() {
                if !self.pending.is_empty() {
                    return Some(Ok(std::mem::take(&mut self.pending)));
                }
                return self.finish().await;
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.pending.extend_from_slice(&available[..=pos]);
                self.stdout.consume(pos + 1);
                let mut line = std::mem::take(&mut self.pending);
                trim_line_ending(&mut line);
                return Some(Ok(line));
            }

            let len = available.len();
            self.pending.extend_from_slice(available);
            self.stdout.consume(len);
        }
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        futures::stream::unfold(self, |mut lines| async move {
            let item = lines.next().await?;
            Some((item, lines))
        })
    }

    async fn finish(&mut self) -> Option<Result<Vec<u8>>> {
        self.done = true;
        let status = self.child.lock().await.wait().await;
        self.reaped = true;
        if let Some(mut task) = self.stderr_task.take() {
            if tokio::time::timeout(THREAD_JOIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("one-shot stderr reader did not finish, aborting");
                task.abort();
            }
        }

        match status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(Error::CliExit {
                exit_code: status.code(),
                stderr: self.stderr.lock().await.joined(),
            })),
            Err(e) => Some(Err(Error::Io(e))),
        }
    }
}

impl Drop for AsyncRawLines {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if self.reaped {
            return;
        }
        // kill_on_drop covers the case where no runtime is available
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let child = Arc::clone(&self.child);
            runtime.spawn(async move {
                terminate_async(&child, PROCESS_WAIT_TIMEOUT).await;
            });
        }
    }
}

impl std::fmt::Debug for AsyncRawLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRawLines")
            .field("pid", &self.pid)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn clean_exit_ends_iteration() {
        let lines: Vec<Vec<u8>> = execute(&sh("printf 'a\\r\\nb\\n'"), &SpawnOptions::default())
            .unwrap()
            .map(|line| line.unwrap())
            .collect();
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn non_zero_exit_is_reported_last() {
        let mut lines = execute(&sh("echo out; echo bad >&2; exit 4"), &SpawnOptions::default()).unwrap();
        assert_eq!(lines.next().unwrap().unwrap(), b"out");
        match lines.next() {
            Some(Err(Error::CliExit { exit_code, stderr })) => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(stderr, "bad");
            }
            other => panic!("expected CliExit, got {other:?}"),
        }
        assert!(lines.next().is_none());
    }

    #[test]
    fn missing_program_is_cli_not_found() {
        let argv = vec!["/nonexistent/claude-binary".to_string()];
        assert!(matches!(
            execute(&argv, &SpawnOptions::default()),
            Err(Error::CliNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn async_run_keeps_partial_last_line() {
        let mut lines = execute_async(&sh("printf 'one\\ntwo'"), &SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(lines.next().await.unwrap().unwrap(), b"one");
        assert_eq!(lines.next().await.unwrap().unwrap(), b"two");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn async_non_zero_exit() {
        let mut lines = execute_async(&sh("echo nope >&2; exit 2"), &SpawnOptions::default())
            .await
            .unwrap();
        match lines.next().await {
            Some(Err(Error::CliExit { exit_code, stderr })) => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "nope");
            }
            other => panic!("expected CliExit, got {other:?}"),
        }
    }
}
