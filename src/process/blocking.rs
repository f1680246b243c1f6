//! Thread-model persistent process manager.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::{
    join_bounded, reap_blocking, spawn_error, std_command, terminate_blocking, trim_line_ending, CommandSpec,
    SpawnOptions, StderrBuffer, WorkerError, DRAIN_QUEUE_MAX_ITEMS, EXIT_DRAIN_GRACE,
    MAX_INITIALIZATION_WAIT, MAX_QUEUE_SIZE, PROCESS_WAIT_TIMEOUT, QUEUE_PUT_TIMEOUT,
    STDERR_READER, STDOUT_READER, THREAD_JOIN_TIMEOUT, WRITER,
};
use crate::protocol::{new_request_id, OutboundMessage};
use crate::{Error, Result};

enum Outbound {
    Line(String),
    Shutdown,
}

enum Inbound {
    Line(Vec<u8>),
    Eof,
}

struct Running {
    child: Arc<Mutex<Child>>,
    pid: u32,
    outbound: Sender<Outbound>,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    errors: Receiver<WorkerError>,
    stderr: Arc<Mutex<StderrBuffer>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

enum Phase {
    Idle,
    Starting,
    Running(Running),
    Stopping(Arc<Mutex<Child>>),
}

/// A long-lived CLI child driven from OS threads.
///
/// Three worker threads serve each child: a stdin writer fed from a bounded
/// outbound queue, a stdout reader feeding a bounded inbound queue, and a
/// stderr reader filling a capped line buffer. All methods take `&self`
/// and are safe to call from any thread.
///
/// The manager is reusable: after [`stop`](Self::stop) it is idle again and
/// [`start`](Self::start) may launch a fresh child.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use claude_duplex::process::PersistentProcess;
///
/// let process = PersistentProcess::new();
/// process.start(&["cat".to_string()], &Default::default())?;
/// process.write_request(&serde_json::json!({"ping": 1}))?;
/// for line in process.read_lines(Duration::from_secs(1))? {
///     println!("{}", String::from_utf8_lossy(&line?));
///     break;
/// }
/// process.stop();
/// ```
pub struct PersistentProcess {
    phase: Mutex<Phase>,
    changed: Condvar,
    debug: bool,
}

impl Default for PersistentProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentProcess {
    pub fn new() -> Self {
        Self::with_debug(false)
    }

    /// Manager that traces every line crossing the pipes.
    pub fn with_debug(debug: bool) -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            changed: Condvar::new(),
            debug,
        }
    }

    /// Spawn `argv` and launch its workers.
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the manager is idle.
    pub fn start(&self, argv: &[String], options: &SpawnOptions) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, Phase::Idle) {
                return Err(Error::AlreadyRunning);
            }
            *phase = Phase::Starting;
        }

        let launched = self.launch(argv, options);

        let mut phase = self.phase.lock();
        let result = match launched {
            Ok(running) => {
                tracing::debug!(pid = running.pid, program = %argv[0], "started persistent process");
                *phase = Phase::Running(running);
                Ok(())
            }
            Err(e) => {
                *phase = Phase::Idle;
                Err(e)
            }
        };
        self.changed.notify_all();
        result
    }

    /// [`start`](Self::start) with a prepared [`CommandSpec`].
    pub fn start_command(&self, command: &CommandSpec) -> Result<()> {
        self.start(&command.argv, &command.options)
    }

    fn launch(&self, argv: &[String], options: &SpawnOptions) -> Result<Running> {
        let mut command = std_command(argv, options)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| spawn_error(&argv[0], e))?;
        let pid = child.id();

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let child = Arc::new(Mutex::new(child));
        let (outbound, outbound_rx) = bounded(MAX_QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = bounded(MAX_QUEUE_SIZE);
        let (errors_tx, errors) = unbounded();
        let stderr_buffer = Arc::new(Mutex::new(StderrBuffer::new()));
        let debug = self.debug;

        let mut workers = Vec::with_capacity(3);
        let spawned = (|| -> std::io::Result<()> {
            let errors = errors_tx.clone();
            workers.push((
                WRITER,
                spawn_worker(format!("claude-stdin-{pid}"), move || {
                    write_loop(stdin, outbound_rx, errors, debug)
                })?,
            ));

            let errors = errors_tx.clone();
            let inbound = inbound_tx.clone();
            workers.push((
                STDOUT_READER,
                spawn_worker(format!("claude-stdout-{pid}"), move || {
                    read_stdout(stdout, inbound, errors, debug)
                })?,
            ));

            let errors = errors_tx.clone();
            let buffer = Arc::clone(&stderr_buffer);
            workers.push((
                STDERR_READER,
                spawn_worker(format!("claude-stderr-{pid}"), move || {
                    read_stderr(stderr, buffer, errors, debug)
                })?,
            ));
            Ok(())
        })();

        if let Err(e) = spawned {
            terminate_blocking(&child, pid, Duration::ZERO);
            return Err(Error::Io(e));
        }

        Ok(Running {
            child,
            pid,
            outbound,
            inbound_tx,
            inbound_rx,
            errors,
            stderr: stderr_buffer,
            workers,
        })
    }

    /// Stop the child and its workers. Idempotent; never fails.
    ///
    /// Waits for an in-flight `start()`, asks the writer to exit, sends
    /// SIGTERM to the child's group, kills it after
    /// [`PROCESS_WAIT_TIMEOUT`], then joins each worker for up to
    /// [`THREAD_JOIN_TIMEOUT`].
    pub fn stop(&self) {
        let running = {
            let mut phase = self.phase.lock();

            let deadline = Instant::now() + MAX_INITIALIZATION_WAIT;
            while matches!(*phase, Phase::Starting) {
                if self.changed.wait_until(&mut phase, deadline).timed_out() {
                    tracing::warn!("start() still in progress, not stopping");
                    return;
                }
            }
            while matches!(*phase, Phase::Stopping(_)) {
                self.changed.wait(&mut phase);
            }

            match std::mem::replace(&mut *phase, Phase::Idle) {
                Phase::Running(running) => {
                    *phase = Phase::Stopping(Arc::clone(&running.child));
                    running
                }
                other => {
                    *phase = other;
                    return;
                }
            }
        };

        let Running {
            child,
            pid,
            outbound,
            inbound_tx,
            inbound_rx,
            errors,
            stderr,
            workers,
        } = running;

        match outbound.try_send(Outbound::Shutdown) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(sentinel)) => {
                if outbound.send_timeout(sentinel, QUEUE_PUT_TIMEOUT).is_err() {
                    tracing::debug!(pid, "outbound queue full, relying on termination");
                }
            }
        }
        drop(outbound);

        let status = terminate_blocking(&child, pid, PROCESS_WAIT_TIMEOUT);
        tracing::debug!(pid, ?status, "persistent process stopped");

        drop((inbound_tx, inbound_rx, errors, stderr));
        for (name, handle) in workers {
            join_bounded(name, handle, THREAD_JOIN_TIMEOUT);
        }

        *self.phase.lock() = Phase::Idle;
        self.changed.notify_all();
    }

    /// Serialize `payload` as one JSON line and queue it for the child.
    ///
    /// Blocks while the outbound queue is full.
    pub fn write_request<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');

        let outbound = match &*self.phase.lock() {
            Phase::Running(running) => running.outbound.clone(),
            _ => return Err(Error::NotRunning),
        };

        if self.debug {
            tracing::debug!(request = line.trim_end(), "queueing request");
        }
        outbound
            .send(Outbound::Line(line))
            .map_err(|_| Error::NotRunning)
    }

    /// Queue an interrupt control request; returns its request id.
    ///
    /// The acknowledgement, if any, arrives on the normal output stream.
    pub fn write_interrupt(&self) -> Result<String> {
        let request_id = new_request_id();
        self.write_request(&OutboundMessage::interrupt(request_id.clone()))?;
        Ok(request_id)
    }

    /// Iterate stdout lines, polling every `timeout`.
    ///
    /// On each silent poll the iterator checks for worker failures and for
    /// a dead child, yielding [`Error::Worker`] or [`Error::UnexpectedExit`]
    /// and then ending. A clean end of stdout ends the iterator without an
    /// error.
    pub fn read_lines(&self, timeout: Duration) -> Result<Lines> {
        match &*self.phase.lock() {
            Phase::Running(running) => Ok(Lines {
                rx: running.inbound_rx.clone(),
                tx: running.inbound_tx.clone(),
                errors: running.errors.clone(),
                child: Arc::clone(&running.child),
                stderr: Arc::clone(&running.stderr),
                timeout,
                stop: None,
                finished: false,
            }),
            _ => Err(Error::NotRunning),
        }
    }

    /// True while a child exists and has not exited.
    pub fn is_alive(&self) -> bool {
        let child = match &*self.phase.lock() {
            Phase::Running(running) => Arc::clone(&running.child),
            Phase::Stopping(child) => Arc::clone(child),
            Phase::Idle | Phase::Starting => return false,
        };
        let alive = reap_blocking(&mut child.lock()).is_none();
        alive
    }

    /// Snapshot of the most recent stderr lines.
    pub fn get_stderr(&self) -> Vec<String> {
        match &*self.phase.lock() {
            Phase::Running(running) => running.stderr.lock().snapshot(),
            _ => Vec::new(),
        }
    }

    /// OS process id of the running child.
    pub fn pid(&self) -> Option<u32> {
        match &*self.phase.lock() {
            Phase::Running(running) => Some(running.pid),
            _ => None,
        }
    }
}

impl Drop for PersistentProcess {
    fn drop(&mut self) {
        if !matches!(*self.phase.get_mut(), Phase::Idle) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for PersistentProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentProcess")
            .field("pid", &self.pid())
            .field("debug", &self.debug)
            .finish()
    }
}

/// Lines read from a [`PersistentProcess`].
///
/// Dropping the iterator before it ends discards up to
/// [`DRAIN_QUEUE_MAX_ITEMS`] queued lines; a queued end-of-stream marker
/// is kept for the next reader.
pub struct Lines {
    rx: Receiver<Inbound>,
    tx: Sender<Inbound>,
    errors: Receiver<WorkerError>,
    child: Arc<Mutex<Child>>,
    stderr: Arc<Mutex<StderrBuffer>>,
    timeout: Duration,
    stop: Option<Arc<AtomicBool>>,
    finished: bool,
}

enum Silence {
    Wait,
    Item(Inbound),
    Failed(Error),
    Stopped,
}

impl Lines {
    /// End the iteration at the next silent poll once `flag` is set.
    pub fn stop_when(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn finish(&mut self, last: Option<Result<Vec<u8>>>) -> Option<Result<Vec<u8>>> {
        self.finished = true;
        last
    }

    fn on_silence(&self) -> Silence {
        if let Ok(err) = self.errors.try_recv() {
            return Silence::Failed(err.into());
        }

        let exited = reap_blocking(&mut self.child.lock());
        if let Some(status) = exited {
            return match self.rx.recv_timeout(EXIT_DRAIN_GRACE) {
                Ok(item) => Silence::Item(item),
                Err(_) => Silence::Failed(Error::UnexpectedExit {
                    exit_code: status.code(),
                    stderr: self.stderr.lock().joined(),
                }),
            };
        }

        match &self.stop {
            Some(flag) if flag.load(Ordering::Acquire) => Silence::Stopped,
            _ => Silence::Wait,
        }
    }
}

impl Iterator for Lines {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let item = match self.rx.recv_timeout(self.timeout) {
                Ok(item) => item,
                Err(RecvTimeoutError::Disconnected) => return self.finish(None),
                Err(RecvTimeoutError::Timeout) => match self.on_silence() {
                    Silence::Wait => continue,
                    Silence::Item(item) => item,
                    Silence::Failed(err) => return self.finish(Some(Err(err))),
                    Silence::Stopped => return self.finish(None),
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
}

impl Drop for Lines {
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
                Err(_) => break,
            }
        }
    }
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdin, ChildStdout, ChildStderr)> {
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
    Ok((stdin, stdout, stderr))
}

fn spawn_worker<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(f)
}

fn write_loop(
    mut stdin: ChildStdin,
    outbound: Receiver<Outbound>,
    errors: Sender<WorkerError>,
    debug: bool,
) {
    for item in outbound.iter() {
        let Outbound::Line(line) = item else {
            break;
        };
        if debug {
            tracing::debug!(line = line.trim_end(), "stdin <-");
        }
        if let Err(source) = stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
        {
            tracing::debug!(error = %source, "stdin writer stopped");
            let _ = errors.send(WorkerError::new(WRITER, source));
            break;
        }
    }
}

fn read_stdout(
    stdout: ChildStdout,
    inbound: Sender<Inbound>,
    errors: Sender<WorkerError>,
    debug: bool,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                trim_line_ending(&mut line);
                if debug {
                    tracing::debug!(line = %String::from_utf8_lossy(&line), "stdout ->");
                }
                match inbound.send_timeout(Inbound::Line(line), QUEUE_PUT_TIMEOUT) {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        tracing::warn!("inbound queue full, dropping line");
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return,
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
    let _ = inbound.send(Inbound::Eof);
}

fn read_stderr(
    stderr: ChildStderr,
    buffer: Arc<Mutex<StderrBuffer>>,
    errors: Sender<WorkerError>,
    debug: bool,
) {
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
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
                buffer.lock().push(line.to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                let _ = errors.send(WorkerError::new(STDERR_READER, source));
                break;
            }
        }
    }
}
