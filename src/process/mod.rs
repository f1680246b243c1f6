//! Subprocess management for the Claude CLI.
//!
//! Two ways of running the CLI live here:
//!
//! - Persistent duplex sessions: one long-lived child fed newline-delimited
//!   JSON on stdin while its stdout is streamed back line by line.
//!   [`PersistentProcess`] runs its workers on OS threads,
//!   [`AsyncPersistentProcess`] on tokio tasks. Both follow the same
//!   `Idle -> Starting -> Running -> Stopping -> Idle` lifecycle.
//! - One-shot runs ([`execute`], [`execute_async`]): spawn, stream stdout
//!   lines until exit, fail with [`Error::CliExit`] on a non-zero status.
//!
//! # Architecture
//!
//! ```text
//!  caller ──write_request──▶ [outbound queue] ──writer──▶ stdin  ┐
//!                                                                │ claude CLI
//!  caller ◀──read_lines──── [inbound queue] ◀──reader─── stdout ┤
//!  caller ◀──get_stderr──── [stderr buffer] ◀──reader─── stderr ┘
//! ```
//!
//! Every child is placed in its own process group so a terminal interrupt
//! aimed at the parent is not forwarded to it. Shutdown signals the whole
//! group, which also reaps helpers the CLI spawned.

mod blocking;
mod nonblocking;
mod oneshot;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use blocking::{Lines, PersistentProcess};
pub use nonblocking::{AsyncPersistentProcess, LineStream};
pub use oneshot::{execute, execute_async, AsyncRawLines, RawLines};

use crate::{Error, Result};

/// Stderr lines retained per process; older lines are evicted first.
pub const MAX_STDERR_LINES: usize = 100;

/// Capacity of the outbound and inbound line queues.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// How long `stop()` waits for each worker before detaching it.
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period between SIGTERM and a forced kill.
pub const PROCESS_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Items drained from the inbound queue when a reader is abandoned.
pub const DRAIN_QUEUE_MAX_ITEMS: usize = 1000;

/// How long the stdout reader waits for queue space before dropping a line.
pub const QUEUE_PUT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop()` waits for an in-flight `start()`.
pub const MAX_INITIALIZATION_WAIT: Duration = Duration::from_secs(5);

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Once the child is dead, how long a reader waits for its last lines.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

const WRITER: &str = "stdin writer";
const STDOUT_READER: &str = "stdout reader";
const STDERR_READER: &str = "stderr reader";

/// Working directory and environment overrides for a spawned CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Working directory; must exist.
    pub working_dir: Option<PathBuf>,
    /// Variables merged over the inherited environment.
    pub env: HashMap<String, String>,
}

/// A fully resolved command: program plus arguments, and spawn options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub options: SpawnOptions,
}

impl CommandSpec {
    /// Command with no overrides; `argv[0]` is the program.
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            options: SpawnOptions::default(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }
}

/// Bounded, oldest-first buffer of stderr lines.
#[derive(Debug)]
pub(crate) struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub(crate) fn new() -> Self {
        Self::with_capacity(MAX_STDERR_LINES)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(MAX_STDERR_LINES)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub(crate) fn joined(&self) -> String {
        self.snapshot().join("\n")
    }
}

/// An OS error hit by a background worker.
#[derive(Debug)]
pub(crate) struct WorkerError {
    worker: &'static str,
    source: std::io::Error,
}

impl WorkerError {
    pub(crate) fn new(worker: &'static str, source: std::io::Error) -> Self {
        Self { worker, source }
    }
}

impl From<WorkerError> for Error {
    fn from(err: WorkerError) -> Self {
        Error::Worker {
            worker: err.worker,
            source: err.source,
        }
    }
}

/// Build a std command for `argv`, isolated in its own process group.
pub(crate) fn std_command(argv: &[String], options: &SpawnOptions) -> Result<std::process::Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::InvalidConfig("command is empty".into()));
    };

    let mut command = std::process::Command::new(program);
    command.args(args);

    if let Some(dir) = &options.working_dir {
        if !dir.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
        command.current_dir(dir);
    }
    command.envs(&options.env);

    isolate(&mut command);
    Ok(command)
}

#[cfg(unix)]
fn isolate(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn isolate(command: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn isolate(_command: &mut std::process::Command) {}

pub(crate) fn spawn_error(program: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::CliNotFound {
            searched: program.to_string(),
        }
    } else {
        Error::ProcessSpawn(err)
    }
}

/// Strip a trailing `\n` or `\r\n`.
pub(crate) fn trim_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

/// Signal the child's process group. Gone groups are ignored.
#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pid, ?signal, error = %e, "failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _force: bool) {}

/// Reap a std child that has exited.
///
/// The group is swept while the exited leader is still a zombie, since a
/// reaped leader no longer holds its pgid.
pub(crate) fn reap_blocking(child: &mut Child) -> Option<ExitStatus> {
    if leader_exited(child.id()) {
        signal_group(child.id(), true);
    }
    child.try_wait().ok().flatten()
}

/// Task-model counterpart of [`reap_blocking`].
pub(crate) fn reap_async(child: &mut tokio::process::Child) -> Option<ExitStatus> {
    // `id()` is gone once tokio has reaped the child
    if let Some(pid) = child.id() {
        if leader_exited(pid) {
            signal_group(pid, true);
        }
    }
    child.try_wait().ok().flatten()
}

/// Whether `pid` has exited but not been reaped yet.
#[cfg(all(target_os = "linux", not(target_env = "uclibc")))]
fn leader_exited(pid: u32) -> bool {
    use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    matches!(
        waitid(Id::Pid(Pid::from_raw(raw)), flags),
        Ok(status) if !matches!(status, WaitStatus::StillAlive)
    )
}

#[cfg(not(all(target_os = "linux", not(target_env = "uclibc"))))]
fn leader_exited(_pid: u32) -> bool {
    false
}

/// Terminate a std child: SIGTERM to its group, wait out `grace`, then kill.
pub(crate) fn terminate_blocking(child: &Mutex<Child>, pid: u32, grace: Duration) -> Option<ExitStatus> {
    if let Some(status) = reap_blocking(&mut child.lock()) {
        return Some(status);
    }

    request_exit(child, pid);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        std::thread::sleep(TERMINATE_POLL_INTERVAL);
        if let Some(status) = reap_blocking(&mut child.lock()) {
            return Some(status);
        }
    }

    tracing::warn!(pid, ?grace, "process ignored termination, killing");
    let mut child = child.lock();
    if let Some(status) = reap_blocking(&mut child) {
        return Some(status);
    }
    // still unreaped under the lock, so the pgid is ours
    signal_group(pid, true);
    let _ = child.kill();
    child.wait().ok()
}

#[cfg(unix)]
fn request_exit(_child: &Mutex<Child>, pid: u32) {
    signal_group(pid, false);
}

#[cfg(not(unix))]
fn request_exit(child: &Mutex<Child>, _pid: u32) {
    let _ = child.lock().kill();
}

/// Task-model counterpart of [`terminate_blocking`].
pub(crate) async fn terminate_async(
    child: &tokio::sync::Mutex<tokio::process::Child>,
    grace: Duration,
) {
    if reap_async(&mut *child.lock().await).is_some() {
        return;
    }

    let pid = child.lock().await.id();
    match pid {
        #[cfg(unix)]
        Some(pid) => signal_group(pid, false),
        _ => {
            let _ = child.lock().await.start_kill();
        }
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(TERMINATE_POLL_INTERVAL).await;
        if reap_async(&mut *child.lock().await).is_some() {
            return;
        }
    }

    tracing::warn!(?pid, ?grace, "process ignored termination, killing");
    let mut child = child.lock().await;
    kill_group_async(&mut child);
    let _ = child.kill().await;
}

/// Force-kill the group of a tokio child unless the leader is already reaped.
pub(crate) fn kill_group_async(child: &mut tokio::process::Child) {
    if reap_async(child).is_none() {
        if let Some(pid) = child.id() {
            signal_group(pid, true);
        }
    }
}

/// Join a worker thread, giving up after `timeout`.
///
/// Threads cannot be cancelled; one that misses the deadline is detached.
pub(crate) fn join_bounded(name: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(worker = name, ?timeout, "worker did not finish, detaching");
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        tracing::warn!(worker = name, "worker panicked");
    }
    true
}
