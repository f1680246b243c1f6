//! Task-model persistent process manager.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::{
    kill_group_async, reap_async, spawn_error, std_command, terminate_async, trim_line_ending, CommandSpec,
    SpawnOptions, StderrBuffer, WorkerError, DRAIN_QUEUE_MAX_ITEMS, EXIT_DRAIN_GRACE,
    MAX_QUEUE_SIZE, PROCESS_WAIT_TIMEOUT, QUEUE_PUT_TIMEOUT, STDERR_READER, STDOUT_READER,
    THREAD_JOIN_TIMEOUT, WRITER,
};
use crate::protocol::{new_request_id, OutboundMessage};
use crate::{Error, Result};

#[derive(Debug)]
enum Outbound {
    Line(String),
    Shutdown,
}

#[derive(Debug)]
enum Inbound {
    Line(Vec<u8>),
    Eof,
}

/// Handles shared by callers of the current child.
struct Handles {
    child: Arc<Mutex<Child>>,
    pid: Option<u32>,
    outbound: mpsc::Sender<Outbound>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    errors: Arc<Mutex<mpsc::UnboundedReceiver<WorkerError>>>,
    stderr: Arc<Mutex<StderrBuffer>>,
}

impl Handles {
    /// Kill the child's group without waiting. Skipped if the child is locked.
    fn force_kill(&self) {
        if let Ok(mut child) = self.child.try_lock() {
            kill_group_async(&mut child);
        }
    }
}

type Tasks = Vec<(&'static str, JoinHandle<()>)>;

/// A long-lived CLI child driven from tokio tasks.
///
/// Same contract as [`PersistentProcess`](super::PersistentProcess), with
/// the three workers running as tasks and every wait being an `.await`.
/// `start` and `stop` are serialized by an async lifecycle lock, so a
/// `stop` issued during `start` waits for it to finish.
///
/// Dropping a running manager aborts its tasks and kills the child's
/// process group without waiting; call [`stop`](Self::stop) for a
/// graceful shutdown.
pub struct AsyncPersistentProcess {
    lifecycle: Mutex<Option<Tasks>>,
    current: watch::Sender<Option<Arc<Handles>>>,
    debug: bool,
}

impl Default for AsyncPersistentProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncPersistentProcess {
    pub fn new() -> Self {
        Self::with_debug(false)
    }

    /// Manager that traces every line crossing the pipes.
    pub fn with_debug(debug: bool) -> Self {
        Self {
            lifecycle: Mutex::new(None),
            current: watch::channel(None).0,
            debug,
        }
    }

    fn handles(&self) -> Option<Arc<Handles>> {
        self.current.borrow().clone()
    }

    /// Kill the running child's group without waiting for it.
    pub(crate) fn force_kill(&self) {
        if let Some(handles) = self.handles() {
            handles.force_kill();
        }
    }

    /// Spawn `argv` and launch its worker tasks.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the manager is idle.
    pub async fn start(&self, argv: &[String], options: &SpawnOptions) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let (handles, tasks) = self.launch(argv, options)?;
        tracing::debug!(pid = ?handles.pid, program = %argv[0], "started persistent process");
        self.current.send_replace(Some(Arc::new(handles)));
        *lifecycle = Some(tasks);
        Ok(())
    }

    /// [`start`](Self::start) with a prepared [`CommandSpec`].
    pub async fn start_command(&self, command: &CommandSpec) -> Result<()> {
        self.start(&command.argv, &command.options).await
    }

    fn launch(&self, argv: &[String], options: &SpawnOptions) -> Result<(Handles, Tasks)> {
        let mut command = tokio::process::Command::from(std_command(argv, options)?);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| spawn_error(&argv[0], e))?;
        let pid = child.id();

        // kill_on_drop reaps the child if a pipe is missing
        let stdin = child
            .stdin
            .take()
            .ok_or(Error::PipeUnavailable { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(Error::PipeUnavailable { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(Error::PipeUnavailable { stream: "stderr" })?;

        let (outbound, outbound_rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let stderr_buffer = Arc::new(Mutex::new(StderrBuffer::new()));
        let debug = self.debug;

        let tasks = vec![
            (
                WRITER,
                tokio::spawn(write_loop(stdin, outbound_rx, errors_tx.clone(), debug)),
            ),
            (
                STDOUT_READER,
                tokio::spawn(read_stdout(
                    stdout,
                    inbound_tx.clone(),
                    errors_tx.clone(),
                    debug,
                )),
            ),
            (
                STDERR_READER,
                tokio::spawn(read_stderr(
                    stderr,
                    Arc::clone(&stderr_buffer),
                    errors_tx,
                    debug,
                )),
            ),
        ];

        let handles = Handles {
            child: Arc::new(Mutex::new(child)),
            pid,
            outbound,
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            errors: Arc::new(Mutex::new(errors)),
            stderr: stderr_buffer,
        };
        Ok((handles, tasks))
    }

    /// Stop the child and its tasks. Idempotent; never fails.
    ///
    /// Tasks that do not finish within [`THREAD_JOIN_TIMEOUT`] are aborted.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(tasks) = lifecycle.take() else {
            return;
        };
        let Some(handles) = self.current.send_replace(None) else {
            return;
        };

        match handles.outbound.try_send(Outbound::Shutdown) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(sentinel)) => {
                if handles
                    .outbound
                    .send_timeout(sentinel, QUEUE_PUT_TIMEOUT)
                    .await
                    .is_err()
                {
                    tracing::debug!(pid = ?handles.pid, "outbound queue full, relying on termination");
                }
            }
        }

        terminate_async(&handles.child, PROCESS_WAIT_TIMEOUT).await;
        tracing::debug!(pid = ?handles.pid, "persistent process stopped");
        drop(handles);

        for (name, mut task) in tasks {
            if tokio::time::timeout(THREAD_JOIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!(worker = name, "worker did not finish, aborting");
                task.abort();
            }
        }
    }

    /// Serialize `payload` as one JSON line and queue it for the child.
    ///
    /// Waits while the outbound queue is full.
    pub async fn write_request<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');

        let handles = self.handles().ok_or(Error::NotRunning)?;
        if self.debug {
            tracing::debug!(request = line.trim_end(), "queueing request");
        }
        handles
            .outbound
            .send(Outbound::Line(line))
            .await
            .map_err(|_| Error::NotRunning)
    }

    /// Queue an interrupt control request; returns its request id.
    pub async fn write_interrupt(&self) -> Result<String> {
        let request_id = new_request_id();
        self.write_request(&OutboundMessage::interrupt(request_id.clone()))
            .await?;
        Ok(request_id)
    }

    /// Stream stdout lines, polling every `timeout`.
    ///
    /// Only one stream reads at a time; this waits for any earlier
    /// [`LineStream`] of the same child to be dropped.
    pub async fn read_lines(&self, timeout: Duration) -> Result<LineStream> {
        let handles = self.handles().ok_or(Error::NotRunning)?;
        let rx = Arc::clone(&handles.inbound_rx).lock_owned().await;
        Ok(LineStream {
            rx,
            tx: handles.inbound_tx.clone(),
            errors: Arc::clone(&handles.errors),
            child: Arc::clone(&handles.child),
            stderr: Arc::clone(&handles.stderr),
            timeout,
            finished: false,
        })
    }

    /// True while a child exists and has not exited.
    pub async fn is_alive(&self) -> bool {
        let Some(handles) = self.handles() else {
            return false;
        };
        let alive = reap_async(&mut *handles.child.lock().await).is_none();
        alive
    }

    /// Snapshot of the most recent stderr lines.
    pub async fn get_stderr(&self) -> Vec<String> {
        match self.handles() {
            Some(handles) => handles.stderr.lock().await.snapshot(),
            None => Vec::new(),
        }
    }

    /// OS process id of the running child.
    pub fn pid(&self) -> Option<u32> {
        self.handles().and_then(|handles| handles.pid)
    }
}

impl Drop for AsyncPersistentProcess {
    fn drop(&mut self) {
        if let Some(tasks) = self.lifecycle.get_mut().take() {
            for (_, task) in tasks {
                task.abort();
            }
        }
        if let Some(handles) = self.current.send_replace(None) {
            handles.force_kill();
        }
    }
}

impl std::fmt::Debug for AsyncPersistentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPersistentProcess")
            .field("pid", &self.pid())
            .field("debug", &self.debug)
            .finish()
    }
}

/// Lines read from an [`AsyncPersistentProcess`].
///
/// Holds the inbound queue exclusively until dropped. `next()` is cancel
/// safe. Dropping the stream before it ends discards up to
/// [`DRAIN_QUEUE_MAX_ITEMS`] queued lines and keeps a queued
/// end-of-stream marker for the next reader.
pub struct LineStream {
    rx: OwnedMutexGuard<mpsc::Receiver<Inbound>>,
    tx: mpsc::Sender<Inbound>,
    errors: Arc<Mutex<mpsc::UnboundedReceiver<WorkerError>>>,
    child: Arc<Mutex<Child>>,
    stderr: Arc<Mutex<StderrBuffer>>,
    timeout: Duration,
    finished: bool,
}

enum Silence {
    Wait,
    Item(Inbound),
    Failed(Error),
}

impl LineStream {
    /// Next line, `None` at end of stream, or the failure that ended it.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        if self.finished {
            return None;
        }

        loop {
            let item = match tokio::time::timeout(self.timeout, self.rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => return self.finish(None),
                Err(_) => match self.on_silence().await {
                    Silence::Wait => continue,
                    Silence::Item(item) => item,
                    Silence::Failed(err) => return self.finish(Some(Err(err))),
                },
            };

            match item {
                Inbound::Line(line) => return Some(Ok(line)),
                Inbound::Eof => {
                    let _ = self.tx.try_send(Inbound::Eof);
                    return self.finish(None);
                }
            }
        }
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        futures::stream::unfold(self, |mut lines| async move {
            let item = lines.next().await?;
            Some((item, lines))
        })
    }

    fn finish(&mut self, last: Option<Result<Vec<u8>>>) -> Option<Result<Vec<u8>>> {
        self.finished = true;
        last
    }

    async fn on_silence(&mut self) -> Silence {
        if let Ok(err) = self.errors.lock().await.try_recv() {
            return Silence::Failed(err.into());
        }

        let exited = reap_async(&mut *self.child.lock().await);
        let Some(status) = exited else {
            return Silence::Wait;
        };

        match tokio::time::timeout(EXIT_DRAIN_GRACE, self.rx.recv()).await {
            Ok(Some(item)) => Silence::Item(item),
            _ => Silence::Failed(Error::UnexpectedExit {
                exit_code: status.code(),
                stderr: self.stderr.lock().await.joined(),
            }),
        }
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for _ in 0..DRAIN_QUEUE_MAX_ITEMS {
            match self.rx.try_recv() {
                Ok(Inbound::Line(_)) => {}
                Ok(Inbound::Eof) => {
                    let _ = self.tx.try_send(Inbound::Eof);
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut outbound: mpsc::Receiver<Outbound>,
    errors: mpsc::UnboundedSender<WorkerError>,
    debug: bool,
) {
    while let Some(Outbound::Line(line)) = outbound.recv().await {
        if debug {
            tracing::debug!(line = line.trim_end(), "stdin <-");
        }
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(source) = written.await {
            tracing::debug!(error = %source, "stdin writer stopped");
            let _ = errors.send(WorkerError::new(WRITER, source));
            break;
        }
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    inbound: mpsc::Sender<Inbound>,
    errors: mpsc::UnboundedSender<WorkerError>,
    debug: bool,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                trim_line_ending(&mut line);
                if debug {
                    tracing::debug!(line = %String::from_utf8_lossy(&line), "stdout ->");
                }
                match inbound
                    .send_timeout(Inbound::Line(line), QUEUE_PUT_TIMEOUT)
                    .await
                {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        tracing::warn!("inbound queue full, dropping line");
                    }
                    Err(SendTimeoutError::Closed(_)) => return,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                tracing::debug!(error = %source, "stdout reader stopped");
                let _ = errors.send(WorkerError::new(STDOUT_READER, source));
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Eof).await;
}

async fn read_stderr(
    stderr: ChildStderr,
    buffer: Arc<Mutex<StderrBuffer>>,
    errors: mpsc::UnboundedSender<WorkerError>,
    debug: bool,
) {
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                if debug {
                    tracing::debug!(line, "stderr");
                }
                buffer.lock().await.push(line.to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                let _ = errors.send(WorkerError::new(STDERR_READER, source));
                break;
            }
        }
    }
}
