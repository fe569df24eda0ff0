//! Process supervisor.
//!
//! One actor task owns the table of live processes; everything else talks to
//! it through [`ProcessSupervisor`]. Each child gets a driver task that pumps
//! its output to the [`OutputSink`] in production order, handles kill
//! escalation and, once the child is gone, emits the single exit line and the
//! [`ExitEvent`] before the handle is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clickup_orchestrator_core::model::{exit_line, CommandSpec, UnitId};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// How long output readers may keep draining after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the driver waits for the exit event to be handled.
const EXIT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{} already has a running process", .0.describe())]
    AlreadyRunning(UnitId),
    #[error("{} has no running process", .0.describe())]
    NotRunning(UnitId),
    #[error("Working directory does not exist: {0}")]
    WorkingDirMissing(String),
    #[error("The '{0}' command is not found in PATH.")]
    AgentNotFound(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to write to process stdin: {0}")]
    Stdin(String),
    #[error("process supervisor is not running")]
    Closed,
}

/// Receives every output line of every supervised process.
///
/// Called from the process's driver task; implementations must not block.
pub trait OutputSink: Send + Sync + 'static {
    /// A new process for `id` has started.
    fn started(&self, _id: &UnitId, _pid: u32) {}

    fn line(&self, id: &UnitId, line: &str, is_stderr: bool);
}

/// Delivered once per process after its exit line was emitted.
///
/// The handle stays registered until the event is acknowledged (or dropped),
/// so state derived from the exit is in place before `is_running` flips.
#[derive(Debug)]
pub struct ExitEvent {
    pub id: UnitId,
    pub pid: u32,
    pub exit_code: i32,
    /// The process was terminated through [`ProcessSupervisor::kill`].
    pub killed: bool,
    done: oneshot::Sender<()>,
}

impl ExitEvent {
    pub fn ack(self) {
        let _ = self.done.send(());
    }
}

enum Request {
    Spawn {
        id: UnitId,
        cmd: CommandSpec,
        cwd: PathBuf,
        reply: oneshot::Sender<Result<u32, SupervisorError>>,
    },
    Input {
        id: UnitId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Kill {
        id: UnitId,
        reply: oneshot::Sender<bool>,
    },
    Pid {
        id: UnitId,
        reply: oneshot::Sender<Option<u32>>,
    },
    Running {
        reply: oneshot::Sender<Vec<UnitId>>,
    },
    WaitExit {
        id: UnitId,
        reply: oneshot::Sender<Option<i32>>,
    },
    KillAll {
        reply: oneshot::Sender<usize>,
    },
    Exited {
        id: UnitId,
        generation: u64,
        exit_code: i32,
    },
}

struct Entry {
    pid: u32,
    generation: u64,
    kill_tx: mpsc::UnboundedSender<()>,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    waiters: Vec<oneshot::Sender<Option<i32>>>,
}

/// Handle to the supervisor actor. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    tx: mpsc::UnboundedSender<Request>,
}

impl ProcessSupervisor {
    /// Starts the actor. Exit events arrive on the returned receiver and must
    /// be acknowledged (see [`ExitEvent::ack`]).
    pub fn new(
        sink: Arc<dyn OutputSink>,
        kill_grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            entries: HashMap::new(),
            next_generation: 0,
            self_tx: tx.downgrade(),
            sink,
            exit_tx,
            kill_grace,
        };
        tokio::spawn(actor.run(rx));
        (Self { tx }, exit_rx)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Spawns `cmd` in `cwd` as the process for `id`; returns its pid.
    pub async fn spawn(&self, id: UnitId, cmd: CommandSpec, cwd: &Path) -> Result<u32, SupervisorError> {
        let cwd = cwd.to_path_buf();
        self.call(|reply| Request::Spawn { id, cmd, cwd, reply }).await?
    }

    /// Queues raw bytes for the process's stdin.
    pub async fn write_input(&self, id: &UnitId, data: Vec<u8>) -> Result<(), SupervisorError> {
        let id = id.clone();
        self.call(|reply| Request::Input { id, data, reply }).await?
    }

    /// Terminates the process (SIGTERM, then SIGKILL after the grace period).
    /// Returns `false` when nothing was running; that is not an error.
    pub async fn kill(&self, id: &UnitId) -> Result<bool, SupervisorError> {
        let id = id.clone();
        self.call(|reply| Request::Kill { id, reply }).await
    }

    pub async fn pid(&self, id: &UnitId) -> Option<u32> {
        let id = id.clone();
        self.call(|reply| Request::Pid { id, reply }).await.ok().flatten()
    }

    pub async fn is_running(&self, id: &UnitId) -> bool {
        self.pid(id).await.is_some()
    }

    /// Snapshot of the ids with a live handle.
    pub async fn running(&self) -> Vec<UnitId> {
        self.call(|reply| Request::Running { reply }).await.unwrap_or_default()
    }

    /// Waits until the handle for `id` is released and returns the exit code;
    /// `None` if nothing was running.
    pub async fn wait_exit(&self, id: &UnitId) -> Option<i32> {
        let id = id.clone();
        self.call(|reply| Request::WaitExit { id, reply }).await.ok().flatten()
    }

    /// Kills every live process; returns how many were signalled.
    pub async fn kill_all(&self) -> usize {
        self.call(|reply| Request::KillAll { reply }).await.unwrap_or(0)
    }
}

struct Actor {
    entries: HashMap<UnitId, Entry>,
    next_generation: u64,
    self_tx: mpsc::WeakUnboundedSender<Request>,
    sink: Arc<dyn OutputSink>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    kill_grace: Duration,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(req) = rx.recv().await {
            match req {
                Request::Spawn { id, cmd, cwd, reply } => {
                    let _ = reply.send(self.spawn(id, cmd, &cwd));
                }
                Request::Input { id, data, reply } => {
                    let res = match self.entries.get(&id) {
                        None => Err(SupervisorError::NotRunning(id)),
                        Some(entry) => match &entry.stdin_tx {
                            Some(stdin) if stdin.send(data).is_ok() => Ok(()),
                            _ => Err(SupervisorError::Stdin("stdin is closed".to_string())),
                        },
                    };
                    let _ = reply.send(res);
                }
                Request::Kill { id, reply } => {
                    let signalled = match self.entries.get(&id) {
                        Some(entry) => entry.kill_tx.send(()).is_ok(),
                        None => false,
                    };
                    let _ = reply.send(signalled);
                }
                Request::Pid { id, reply } => {
                    let _ = reply.send(self.entries.get(&id).map(|e| e.pid));
                }
                Request::Running { reply } => {
                    let _ = reply.send(self.entries.keys().cloned().collect());
                }
                Request::WaitExit { id, reply } => match self.entries.get_mut(&id) {
                    Some(entry) => entry.waiters.push(reply),
                    None => {
                        let _ = reply.send(None);
                    }
                },
                Request::KillAll { reply } => {
                    let n = self
                        .entries
                        .values()
                        .filter(|e| e.kill_tx.send(()).is_ok())
                        .count();
                    let _ = reply.send(n);
                }
                Request::Exited {
                    id,
                    generation,
                    exit_code,
                } => {
                    let current = self.entries.get(&id).map(|e| e.generation);
                    if current == Some(generation) {
                        if let Some(entry) = self.entries.remove(&id) {
                            for waiter in entry.waiters {
                                let _ = waiter.send(Some(exit_code));
                            }
                        }
                    }
                }
            }
        }
        debug!("process supervisor stopped");
    }

    fn spawn(&mut self, id: UnitId, cmd: CommandSpec, cwd: &Path) -> Result<u32, SupervisorError> {
        if self.entries.contains_key(&id) {
            return Err(SupervisorError::AlreadyRunning(id));
        }
        if !cwd.is_dir() {
            return Err(SupervisorError::WorkingDirMissing(cwd.display().to_string()));
        }
        let Some(actor_tx) = self.self_tx.upgrade() else {
            return Err(SupervisorError::Closed);
        };

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(&cmd.env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SupervisorError::AgentNotFound(cmd.program.clone()),
                _ => SupervisorError::Spawn(e.to_string()),
            })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn("process exited before it was tracked".to_string()));
        };

        let stdin_tx = child.stdin.take().map(|stdin| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_stdin(id.clone(), stdin, rx));
            tx
        });
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        self.next_generation += 1;
        let generation = self.next_generation;

        self.sink.started(&id, pid);
        info!(unit = %id, pid, program = %cmd.program, cwd = %cwd.display(), "process spawned");

        let driver = Driver {
            id: id.clone(),
            pid,
            generation,
            sink: self.sink.clone(),
            exit_tx: self.exit_tx.clone(),
            actor_tx,
            kill_grace: self.kill_grace,
        };
        tokio::spawn(driver.run(child, kill_rx));

        self.entries.insert(
            id,
            Entry {
                pid,
                generation,
                kill_tx,
                stdin_tx,
                waiters: Vec::new(),
            },
        );
        Ok(pid)
    }
}

struct Driver {
    id: UnitId,
    pid: u32,
    generation: u64,
    sink: Arc<dyn OutputSink>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    actor_tx: mpsc::UnboundedSender<Request>,
    kill_grace: Duration,
}

impl Driver {
    async fn run(self, mut child: Child, mut kill_rx: mpsc::UnboundedReceiver<()>) {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(String, bool)>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(out, false, line_tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(err, true, line_tx.clone())));
        }
        drop(line_tx);

        let mut killed = false;
        let mut escalate_at: Option<Instant> = None;

        let status = loop {
            tokio::select! {
                Some((line, is_stderr)) = line_rx.recv() => {
                    self.sink.line(&self.id, &line, is_stderr);
                }
                Some(()) = kill_rx.recv(), if !killed => {
                    killed = true;
                    info!(unit = %self.id, pid = self.pid, "terminating process");
                    signal_group(self.pid, Signal::SIGTERM);
                    escalate_at = Some(Instant::now() + self.kill_grace);
                }
                _ = sleep_until(escalate_at.unwrap_or_else(Instant::now)), if escalate_at.is_some() => {
                    warn!(unit = %self.id, pid = self.pid, "process ignored SIGTERM; sending SIGKILL");
                    signal_group(self.pid, Signal::SIGKILL);
                    escalate_at = None;
                }
                status = child.wait() => break status,
            }
        };

        let drained = timeout(DRAIN_TIMEOUT, async {
            while let Some((line, is_stderr)) = line_rx.recv().await {
                self.sink.line(&self.id, &line, is_stderr);
            }
        })
        .await;
        if drained.is_err() {
            debug!(unit = %self.id, "output still open after exit; detaching readers");
            for reader in &readers {
                reader.abort();
            }
        }

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(unit = %self.id, error = %e, "failed to wait for process");
                -1
            }
        };
        info!(unit = %self.id, pid = self.pid, exit_code, killed, "process exited");
        self.sink.line(&self.id, &exit_line(exit_code), false);

        let (done, acked) = oneshot::channel();
        let event = ExitEvent {
            id: self.id.clone(),
            pid: self.pid,
            exit_code,
            killed,
            done,
        };
        if self.exit_tx.send(event).is_ok() && timeout(EXIT_ACK_TIMEOUT, acked).await.is_err() {
            warn!(unit = %self.id, "exit event not acknowledged in time");
        }

        let _ = self.actor_tx.send(Request::Exited {
            id: self.id,
            generation: self.generation,
            exit_code,
        });
    }
}

/// Signals the child's process group, falling back to the pid alone.
fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);
    match killpg(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            debug!(pid = raw, error = %e, "killpg failed; signalling pid");
            let _ = kill(pid, sig);
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    is_stderr: bool,
    tx: mpsc::UnboundedSender<(String, bool)>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((line, is_stderr)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, is_stderr, "output stream read failed");
                break;
            }
        }
    }
}

async fn write_stdin(id: UnitId, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            warn!(unit = %id, error = %e, "stdin write failed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(unit = %id, error = %e, "stdin flush failed");
            break;
        }
    }
}
