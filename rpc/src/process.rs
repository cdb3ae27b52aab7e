//! Process supervisor. Owns one external process and its stdio pipes.
//!
//! Knows nothing about protocols. Output is delivered as an ordered stream of
//! [`ProcessEvent`]s: stdout and stderr chunks as they are read, then exactly
//! one [`ProcessEvent::Exited`]. Writes go through a single writer task so
//! bytes reach the child's stdin in call order.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::ProcessError;

const WRITER_CHANNEL_CAPACITY: usize = 64;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long to wait for buffered output after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Environment variables never passed to the child.
///
/// Patterns support a leading and/or trailing `*`.
const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET*",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
];

/// Output and lifecycle notifications from the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The child is gone. `None` when it was killed by a signal.
    Exited(Option<i32>),
}

pub type ProcessEvents = mpsc::Receiver<ProcessEvent>;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

enum WriterCommand {
    Write(Vec<u8>),
    Close,
}

enum Control {
    Terminate,
    Shutdown(Duration),
}

/// Handle to a running external process.
///
/// Dropping the supervisor kills the child.
pub struct ProcessSupervisor {
    label: String,
    pid: Option<u32>,
    writer_tx: mpsc::Sender<WriterCommand>,
    control_tx: Mutex<Option<oneshot::Sender<Control>>>,
    exited: Arc<AtomicBool>,
}

/// `*` may open and/or close a denylist entry; `key` is already uppercase.
fn denylist_entry_matches(entry: &str, key: &str) -> bool {
    let entry = entry.to_uppercase();
    let (anchored_start, rest) = match entry.strip_prefix('*') {
        Some(rest) => (false, rest),
        None => (true, entry.as_str()),
    };
    let (anchored_end, needle) = match rest.strip_suffix('*') {
        Some(needle) => (false, needle),
        None => (true, rest),
    };
    match (anchored_start, anchored_end) {
        (true, true) => key == needle,
        (true, false) => key.starts_with(needle),
        (false, true) => key.ends_with(needle),
        (false, false) => key.contains(needle),
    }
}

fn is_secret_env(key: &str) -> bool {
    let key = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|entry| denylist_entry_matches(entry, &key))
}

impl ProcessSupervisor {
    /// Spawn `spec` with piped stdio.
    ///
    /// Spawn failures (missing executable, permissions) are reported here and
    /// nowhere else.
    pub fn spawn(spec: &ProcessSpec) -> Result<(Self, ProcessEvents), ProcessError> {
        let resolved = which::which(&spec.program).map_err(|source| ProcessError::NotFound {
            command: spec.program.clone(),
            source,
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, _) in std::env::vars_os() {
            if let Some(name) = key.to_str()
                && is_secret_env(name)
            {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::PermissionDenied {
                ProcessError::PermissionDenied {
                    path: resolved.clone(),
                    source,
                }
            } else {
                ProcessError::Spawn {
                    command: spec.program.clone(),
                    source,
                }
            }
        })?;

        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::MissingPipe("stderr"))?;

        let label = spec.program.clone();
        let pid = child.id();
        tracing::info!(process = %label, pid, "spawned {}", resolved.display());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_label = label.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Write(bytes) => {
                        let result = async {
                            stdin.write_all(&bytes).await?;
                            stdin.flush().await
                        }
                        .await;
                        if let Err(e) = result {
                            tracing::warn!(process = %writer_label, "write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Close => break,
                }
            }
            // Dropping stdin closes the pipe.
        });

        let stdout_task = tokio::spawn(pump_stream(stdout, events_tx.clone(), ProcessEvent::Stdout));
        let stderr_task = tokio::spawn(pump_stream(stderr, events_tx.clone(), ProcessEvent::Stderr));

        let (control_tx, control_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let lifecycle_label = label.clone();
        let lifecycle_exited = Arc::clone(&exited);
        tokio::spawn(async move {
            let code = supervise(child, control_rx, &lifecycle_label).await;
            // Deliver everything the child wrote before reporting the exit.
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            })
            .await;
            lifecycle_exited.store(true, Ordering::SeqCst);
            tracing::info!(process = %lifecycle_label, ?code, "process exited");
            let _ = events_tx.send(ProcessEvent::Exited(code)).await;
        });

        Ok((
            Self {
                label,
                pid,
                writer_tx,
                control_tx: Mutex::new(Some(control_tx)),
                exited,
            },
            events_rx,
        ))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Queue `bytes` for the child's stdin.
    ///
    /// Writing to a dead process is logged, never surfaced as an error; the
    /// request that wrote it will time out or be rejected by teardown.
    /// Returns whether the bytes were queued.
    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        if self.writer_tx.send(WriterCommand::Write(bytes)).await.is_err() {
            tracing::warn!(process = %self.label, "dropping write: process stdin is closed");
            return false;
        }
        true
    }

    fn send_control(&self, control: Control) {
        let tx = self
            .control_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(control);
        }
    }

    /// Kill the child now.
    pub fn terminate(&self) {
        self.send_control(Control::Terminate);
    }

    /// Close stdin after pending writes, give the child `grace` to exit on
    /// its own, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.writer_tx.send(WriterCommand::Close).await;
        self.send_control(Control::Shutdown(grace));
    }

    /// A supervisor wired to an in-memory [`RemoteEnd`] instead of an OS
    /// process.
    #[cfg(any(test, feature = "test-support"))]
    #[must_use]
    pub fn in_memory(label: &str) -> (Self, ProcessEvents, RemoteEnd) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = oneshot::channel::<Control>();
        let exited = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(WriterCommand::Write(bytes)) = writer_rx.recv().await {
                if written_tx.send(bytes).is_err() {
                    break;
                }
            }
        });

        let remote = RemoteEnd {
            written: written_rx,
            events_tx: events_tx.clone(),
            exited: Arc::clone(&exited),
            terminated: Arc::clone(&terminated),
        };

        let control_exited = Arc::clone(&exited);
        tokio::spawn(async move {
            // Any control message, or the supervisor being dropped, ends the
            // simulated process.
            let _ = control_rx.await;
            terminated.store(true, Ordering::SeqCst);
            if !control_exited.swap(true, Ordering::SeqCst) {
                let _ = events_tx.send(ProcessEvent::Exited(None)).await;
            }
        });

        (
            Self {
                label: label.to_string(),
                pid: None,
                writer_tx,
                control_tx: Mutex::new(Some(control_tx)),
                exited,
            },
            events_rx,
            remote,
        )
    }
}

async fn pump_stream<R>(
    mut stream: R,
    events_tx: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events_tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("read error on child pipe: {e}");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut control_rx: oneshot::Receiver<Control>,
    label: &str,
) -> Option<i32> {
    let control = tokio::select! {
        status = child.wait() => {
            return status.ok().and_then(|s| s.code());
        }
        control = &mut control_rx => control.unwrap_or(Control::Terminate),
    };

    if let Control::Shutdown(grace) = control {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.ok().and_then(|s| s.code()),
            Err(_) => tracing::debug!(process = %label, "didn't exit in time, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(process = %label, "kill failed: {e}");
    }
    child.wait().await.ok().and_then(|s| s.code())
}

/// Scripted stand-in for the external process.
#[cfg(any(test, feature = "test-support"))]
pub struct RemoteEnd {
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    events_tx: mpsc::Sender<ProcessEvent>,
    exited: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

#[cfg(any(test, feature = "test-support"))]
impl RemoteEnd {
    /// Next chunk the client wrote to "stdin". `None` once the writer closed.
    pub async fn recv_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// A chunk already written, without waiting.
    pub fn try_recv_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }

    pub async fn send_stdout(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.events_tx.send(ProcessEvent::Stdout(bytes.into())).await;
    }

    pub async fn send_stderr(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.events_tx.send(ProcessEvent::Stderr(bytes.into())).await;
    }

    /// Simulate the process exiting on its own.
    pub async fn exit(&self, code: Option<i32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(ProcessEvent::Exited(code)).await;
        }
    }

    /// Whether the client asked for the process to be killed or shut down.
    #[must_use]
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
