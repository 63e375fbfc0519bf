//! Process handles and their control blocks.
//!
//! A `ProcessHandle` wraps either an OS process or an in-process function.
//! Both kinds share one lifecycle, tracked in the handle's control block:
//!
//! ```text
//!   READY ──start()──▶ RUNNING ──wait() / kill()──▶ TERMINATED
//! ```
//!
//! Once started, a driver task owns the running work and publishes its
//! outcome on a watch channel. `wait` and `kill` observe that outcome and
//! finalize the control block; both may run concurrently, and whichever
//! finalizes first wins.
//!
//! Output channels close whenever the work ends, by any path, so readers
//! downstream always see end-of-stream.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weir_types::{ProcessState, ProcessStatus, VirtualId};

use crate::channel::{closed_reader, null_writer, ChannelReader, ChannelWriter};
use crate::error::{ShellError, ShellResult};
use crate::io_buffer::IoBuffer;

/// Channel endpoints handed to an in-process function.
#[derive(Debug)]
pub struct StageIo {
    pub stdin: ChannelReader,
    pub stdout: ChannelWriter,
    pub stderr: ChannelWriter,
}

/// An in-process computation that can run as a pipeline stage.
///
/// The returned code becomes the handle's exit code. Returning an error
/// terminates the handle with exit code 1 and surfaces the error on `wait`.
#[async_trait]
pub trait StageFn: Send + Sync {
    async fn run(&self, io: StageIo) -> ShellResult<i32>;
}

struct FnStage<F>(F);

#[async_trait]
impl<F, Fut> StageFn for FnStage<F>
where
    F: Fn(StageIo) -> Fut + Send + Sync,
    Fut: Future<Output = ShellResult<i32>> + Send + 'static,
{
    async fn run(&self, io: StageIo) -> ShellResult<i32> {
        (self.0)(io).await
    }
}

/// Wrap an async closure as a stage function.
pub fn stage_fn<F, Fut>(f: F) -> Arc<dyn StageFn>
where
    F: Fn(StageIo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ShellResult<i32>> + Send + 'static,
{
    Arc::new(FnStage(f))
}

/// What a handle runs.
#[derive(Clone)]
pub enum ProcessKind {
    /// An OS process: executable plus arguments.
    System { program: String, args: Vec<String> },
    /// An in-process function.
    Function { name: String, func: Arc<dyn StageFn> },
}

impl ProcessKind {
    pub fn system<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessKind::System {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn function(name: impl Into<String>, func: Arc<dyn StageFn>) -> Self {
        ProcessKind::Function {
            name: name.into(),
            func,
        }
    }

    /// Human-readable descriptor: the command line, or the function name.
    pub fn describe(&self) -> String {
        match self {
            ProcessKind::System { program, args } if args.is_empty() => program.clone(),
            ProcessKind::System { program, args } => format!("{} {}", program, args.join(" ")),
            ProcessKind::Function { name, .. } => format!("fn:{}", name),
        }
    }
}

impl std::fmt::Debug for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::System { program, args } => f
                .debug_struct("System")
                .field("program", program)
                .field("args", args)
                .finish(),
            ProcessKind::Function { name, .. } => {
                f.debug_struct("Function").field("name", name).finish()
            }
        }
    }
}

/// Everything the registry needs to create a handle.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    pub fn new(kind: ProcessKind, env: BTreeMap<String, String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            env,
            cwd: cwd.into(),
        }
    }
}

/// Result of waiting on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The handle is terminated. Killed functions carry no exit code.
    Terminated { exit_code: Option<i32> },
    /// The timeout elapsed first. The handle is still running.
    TimedOut,
}

impl WaitOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            WaitOutcome::Terminated { exit_code } => *exit_code,
            WaitOutcome::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }
}

/// How the running work ended, as published by the driver task.
#[derive(Debug, Clone)]
enum Outcome {
    Exited(i32),
    Killed(Option<i32>),
    Failed(String),
    DestroyFailed(String),
}

#[derive(Debug)]
struct ControlBlock {
    state: ProcessState,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    exit_code: Option<i32>,
    os_pid: Option<u32>,
}

/// Channels bound to a handle that has not started yet.
#[derive(Debug, Default)]
pub(crate) struct IoBindings {
    pub(crate) stdin: Option<ChannelReader>,
    pub(crate) stdout: Option<ChannelWriter>,
    pub(crate) stderr: Option<ChannelWriter>,
}

struct Runtime {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<Outcome>>,
    alive: Arc<AtomicBool>,
}

/// A registered unit of work with a forward-only lifecycle.
pub struct ProcessHandle {
    id: VirtualId,
    kind: ProcessKind,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    relay_capacity: usize,
    pcb: Mutex<ControlBlock>,
    io: Mutex<IoBindings>,
    runtime: OnceLock<Runtime>,
}

impl ProcessHandle {
    pub(crate) fn new(id: VirtualId, spec: ProcessSpec, relay_capacity: usize) -> Self {
        Self {
            id,
            kind: spec.kind,
            env: spec.env,
            cwd: spec.cwd,
            relay_capacity,
            pcb: Mutex::new(ControlBlock {
                state: ProcessState::Ready,
                started_at: None,
                ended_at: None,
                exit_code: None,
                os_pid: None,
            }),
            io: Mutex::new(IoBindings::default()),
            runtime: OnceLock::new(),
        }
    }

    pub fn id(&self) -> VirtualId {
        self.id
    }

    pub fn kind(&self) -> &ProcessKind {
        &self.kind
    }

    pub fn command(&self) -> String {
        self.kind.describe()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn state(&self) -> ProcessState {
        self.pcb().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.pcb().exit_code
    }

    pub fn os_pid(&self) -> Option<u32> {
        self.pcb().os_pid
    }

    /// Time spent running so far, or in total once terminated.
    pub fn elapsed(&self) -> Duration {
        let pcb = self.pcb();
        match (pcb.started_at, pcb.ended_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            id: self.id,
            command: self.command(),
            state: self.state(),
            elapsed: self.elapsed(),
            exit_code: self.exit_code(),
            os_pid: self.os_pid(),
        }
    }

    /// Whether the underlying work is still executing.
    ///
    /// Reflects the OS process or task directly, so a process that exited on
    /// its own reports false before anyone has waited on it.
    pub fn is_alive(&self) -> bool {
        match self.runtime.get() {
            Some(rt) => self.state() == ProcessState::Running && rt.alive.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Feed stdin from `reader`. Only allowed while READY.
    pub fn bind_stdin(&self, reader: ChannelReader) -> ShellResult<()> {
        let _pcb = self.ready_pcb("bind stdin")?;
        self.io().stdin = Some(reader);
        Ok(())
    }

    /// Send stdout to `writer`. Only allowed while READY.
    pub fn bind_stdout(&self, writer: ChannelWriter) -> ShellResult<()> {
        let _pcb = self.ready_pcb("bind stdout")?;
        self.io().stdout = Some(writer);
        Ok(())
    }

    /// Send stderr to `writer`. Only allowed while READY.
    pub fn bind_stderr(&self, writer: ChannelWriter) -> ShellResult<()> {
        let _pcb = self.ready_pcb("bind stderr")?;
        self.io().stderr = Some(writer);
        Ok(())
    }

    /// Hand back every bound channel, so a caller whose `start` failed can
    /// undo its wiring. Empty unless READY.
    pub(crate) fn release_bindings(&self) -> IoBindings {
        match self.ready_pcb("release bindings") {
            Ok(_pcb) => std::mem::take(&mut *self.io()),
            Err(_) => IoBindings::default(),
        }
    }

    /// READY → RUNNING. Launches the work with whatever channels are bound;
    /// unbound stdin reads as empty and unbound outputs are discarded.
    ///
    /// If the OS refuses to spawn, the handle stays READY and keeps its
    /// bindings.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, command = %self.command()))]
    pub fn start(&self) -> ShellResult<()> {
        let mut pcb = self.pcb();
        if !pcb.state.can_advance_to(ProcessState::Running) {
            return Err(ShellError::State {
                id: self.id,
                op: "start",
                state: pcb.state,
            });
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        let os_pid = match &self.kind {
            ProcessKind::System { program, args } => {
                let mut child = self.spawn_child(program, args)?;
                let pid = child.id();
                let io = std::mem::take(&mut *self.io());
                let (stdin_pump, output_pumps) = self.attach_pipes(&mut child, io);
                tokio::spawn(drive_system(
                    self.id,
                    child,
                    stdin_pump,
                    output_pumps,
                    cancel.clone(),
                    alive.clone(),
                    outcome_tx,
                ));
                pid
            }
            ProcessKind::Function { func, .. } => {
                let io = std::mem::take(&mut *self.io());
                let stage_io = StageIo {
                    stdin: io.stdin.unwrap_or_else(closed_reader),
                    stdout: io.stdout.unwrap_or_else(null_writer),
                    stderr: io.stderr.unwrap_or_else(null_writer),
                };
                tokio::spawn(drive_function(
                    self.id,
                    func.clone(),
                    stage_io,
                    cancel.clone(),
                    alive.clone(),
                    outcome_tx,
                ));
                None
            }
        };

        // Nothing else can reach this point twice: the READY check above runs
        // under the same lock.
        let _ = self.runtime.set(Runtime {
            cancel,
            outcome: outcome_rx,
            alive,
        });
        pcb.state = ProcessState::Running;
        pcb.started_at = Some(Instant::now());
        pcb.os_pid = os_pid;
        tracing::debug!(os_pid = ?os_pid, "started");
        Ok(())
    }

    /// Wait for the work to finish, then RUNNING → TERMINATED.
    ///
    /// `None` or a zero timeout waits indefinitely. A timeout does not kill
    /// anything; it only stops waiting. Waiting on a terminated handle
    /// returns its recorded exit code.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub async fn wait(&self, timeout: Option<Duration>) -> ShellResult<WaitOutcome> {
        let state = self.state();
        match state {
            ProcessState::Ready => {
                return Err(ShellError::State {
                    id: self.id,
                    op: "wait",
                    state,
                })
            }
            ProcessState::Terminated => {
                return Ok(WaitOutcome::Terminated {
                    exit_code: self.exit_code(),
                })
            }
            ProcessState::Running => {}
        }

        let outcome = match timeout.filter(|t| !t.is_zero()) {
            Some(limit) => match tokio::time::timeout(limit, self.outcome()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(?limit, "wait timed out");
                    return Ok(WaitOutcome::TimedOut);
                }
            },
            None => self.outcome().await,
        };

        let exit_code = self.finish(&outcome)?;
        Ok(WaitOutcome::Terminated { exit_code })
    }

    /// Forcibly end the work, then RUNNING → TERMINATED.
    ///
    /// A no-op on terminated handles and on handles that never started. If
    /// the OS refuses to kill the process, the handle is still marked
    /// TERMINATED and `ProcessDestroy` is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub async fn kill(&self) -> ShellResult<()> {
        match self.state() {
            ProcessState::Ready => {
                tracing::debug!("kill on a handle that never started");
                return Ok(());
            }
            ProcessState::Terminated => return Ok(()),
            ProcessState::Running => {}
        }

        if let Some(rt) = self.runtime.get() {
            rt.cancel.cancel();
        }
        let outcome = self.outcome().await;
        match self.finish(&outcome) {
            Err(err @ ShellError::ProcessDestroy { .. }) => Err(err),
            // A function that failed before the kill landed is still dead;
            // its error belongs to whoever waits on it.
            _ => Ok(()),
        }
    }

    async fn outcome(&self) -> Outcome {
        let Some(rt) = self.runtime.get() else {
            return Outcome::Failed("process has no runtime".into());
        };
        let mut rx = rt.outcome.clone();
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| Outcome::Failed("missing outcome".into())),
            Err(_) => Outcome::Failed("driver task vanished".into()),
        };
        outcome
    }

    /// Record the outcome in the control block. Idempotent: the first caller
    /// sets end time and exit code, later callers read them back.
    fn finish(&self, outcome: &Outcome) -> ShellResult<Option<i32>> {
        let mut pcb = self.pcb();
        let first = pcb.state != ProcessState::Terminated;
        if first {
            pcb.state = ProcessState::Terminated;
            pcb.ended_at = Some(Instant::now());
            pcb.exit_code = match outcome {
                Outcome::Exited(code) => Some(*code),
                Outcome::Killed(code) => *code,
                Outcome::Failed(_) => Some(1),
                Outcome::DestroyFailed(_) => None,
            };
        }
        let exit_code = pcb.exit_code;
        drop(pcb);

        match outcome {
            Outcome::Failed(reason) => {
                if first {
                    Err(ShellError::stage(self.command(), reason))
                } else {
                    Ok(exit_code)
                }
            }
            Outcome::DestroyFailed(reason) => {
                if first {
                    tracing::warn!(id = %self.id, %reason, "forced termination failed; the process may have leaked");
                }
                Err(ShellError::ProcessDestroy {
                    id: self.id,
                    reason: reason.clone(),
                })
            }
            _ => Ok(exit_code),
        }
    }

    fn spawn_child(&self, program: &str, args: &[String]) -> ShellResult<Child> {
        let io = self.io();
        let piped_or_null = |bound: bool| if bound { Stdio::piped() } else { Stdio::null() };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(piped_or_null(io.stdin.is_some()))
            .stdout(piped_or_null(io.stdout.is_some()))
            .stderr(piped_or_null(io.stderr.is_some()))
            .kill_on_drop(true);

        cmd.spawn().map_err(|source| ShellError::Spawn {
            command: self.command(),
            source,
        })
    }

    /// Connect the child's pipes to the bound channels.
    fn attach_pipes(
        &self,
        child: &mut Child,
        io: IoBindings,
    ) -> (Option<JoinHandle<()>>, Vec<JoinHandle<()>>) {
        let id = self.id;
        let stdin_pump = match (io.stdin, child.stdin.take()) {
            (Some(mut reader), Some(mut pipe)) => Some(tokio::spawn(async move {
                // A child that exits without draining stdin breaks the pipe;
                // that is the child's choice, not an error.
                if let Err(e) = tokio::io::copy(&mut reader, &mut pipe).await {
                    tracing::trace!(%id, "stdin pump ended: {}", e);
                }
            })),
            _ => None,
        };

        let capacity = self.relay_capacity;
        let mut output_pumps = Vec::with_capacity(2);
        if let (Some(writer), Some(pipe)) = (io.stdout, child.stdout.take()) {
            output_pumps.push(tokio::spawn(async move {
                if let Err(e) = IoBuffer::relay(capacity, pipe, writer).await {
                    tracing::debug!(%id, "stdout relay ended: {}", e);
                }
            }));
        }
        if let (Some(writer), Some(pipe)) = (io.stderr, child.stderr.take()) {
            output_pumps.push(tokio::spawn(async move {
                if let Err(e) = IoBuffer::relay(capacity, pipe, writer).await {
                    tracing::debug!(%id, "stderr relay ended: {}", e);
                }
            }));
        }

        (stdin_pump, output_pumps)
    }

    /// Lock the control block, failing unless READY. Holding the guard keeps
    /// `start` from racing a binding.
    fn ready_pcb(&self, op: &'static str) -> ShellResult<std::sync::MutexGuard<'_, ControlBlock>> {
        let pcb = self.pcb();
        if pcb.state == ProcessState::Ready {
            Ok(pcb)
        } else {
            Err(ShellError::State {
                id: self.id,
                op,
                state: pcb.state,
            })
        }
    }

    fn pcb(&self) -> std::sync::MutexGuard<'_, ControlBlock> {
        self.pcb.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn io(&self) -> std::sync::MutexGuard<'_, IoBindings> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cwd", &self.cwd)
            .field("pcb", &*self.pcb())
            .finish()
    }
}

/// Exit code of an OS process; `128 + signal` when killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            -1
        }
    })
}

/// Join tasks, dropping each handle once it completes so a cancelled join
/// never re-polls a finished handle.
async fn join_all(tasks: &mut Vec<JoinHandle<()>>) {
    while let Some(task) = tasks.last_mut() {
        let _ = task.await;
        tasks.pop();
    }
}

async fn abort_all(tasks: &mut Vec<JoinHandle<()>>) {
    for task in tasks.iter() {
        task.abort();
    }
    join_all(tasks).await;
}

async fn drive_system(
    id: VirtualId,
    mut child: Child,
    stdin_pump: Option<JoinHandle<()>>,
    mut output_pumps: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    outcome_tx: watch::Sender<Option<Outcome>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    // Whatever is still queued for stdin has nowhere to go.
    if let Some(pump) = stdin_pump {
        pump.abort();
    }

    let outcome = match exited {
        Some(status) => {
            alive.store(false, Ordering::Release);
            // Drain remaining output so readers get every byte, unless a kill
            // arrives while downstream is stalled.
            let killed = tokio::select! {
                _ = join_all(&mut output_pumps) => false,
                _ = cancel.cancelled() => true,
            };
            if killed {
                abort_all(&mut output_pumps).await;
            }
            match status {
                Ok(status) => Outcome::Exited(exit_code(status)),
                Err(e) => Outcome::Failed(format!("wait failed: {}", e)),
            }
        }
        None => {
            let outcome = match child.start_kill() {
                Ok(()) => match child.wait().await {
                    Ok(status) => Outcome::Killed(Some(exit_code(status))),
                    Err(e) => {
                        tracing::debug!(%id, "wait after kill failed: {}", e);
                        Outcome::Killed(None)
                    }
                },
                Err(e) => Outcome::DestroyFailed(e.to_string()),
            };
            alive.store(false, Ordering::Release);
            abort_all(&mut output_pumps).await;
            outcome
        }
    };

    tracing::trace!(%id, ?outcome, "os process finished");
    let _ = outcome_tx.send(Some(outcome));
}

async fn drive_function(
    id: VirtualId,
    func: Arc<dyn StageFn>,
    io: StageIo,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    outcome_tx: watch::Sender<Option<Outcome>>,
) {
    let mut task = tokio::spawn(async move { func.run(io).await });

    let joined = tokio::select! {
        joined = &mut task => Some(joined),
        _ = cancel.cancelled() => None,
    };

    let outcome = match joined {
        Some(Ok(Ok(code))) => Outcome::Exited(code),
        Some(Ok(Err(e))) => Outcome::Failed(e.to_string()),
        Some(Err(e)) => Outcome::Failed(format!("function panicked: {}", e)),
        None => {
            task.abort();
            let _ = task.await;
            Outcome::Killed(None)
        }
    };
    alive.store(false, Ordering::Release);

    tracing::trace!(%id, ?outcome, "function finished");
    let _ = outcome_tx.send(Some(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;

    fn function_handle(id: u64, func: Arc<dyn StageFn>) -> ProcessHandle {
        let spec = ProcessSpec::new(
            ProcessKind::function("test", func),
            BTreeMap::new(),
            std::env::temp_dir(),
        );
        ProcessHandle::new(VirtualId(id), spec, 64)
    }

    fn upper() -> Arc<dyn StageFn> {
        stage_fn(|mut io: StageIo| async move {
            while let Some(chunk) = io.stdin.recv().await {
                io.stdout.send(&chunk.to_ascii_uppercase()).await?;
            }
            Ok::<_, ShellError>(0)
        })
    }

    fn forever() -> Arc<dyn StageFn> {
        stage_fn(|_io: StageIo| async move {
            std::future::pending::<()>().await;
            Ok::<_, ShellError>(0)
        })
    }

    #[test]
    fn test_describe() {
        assert_eq!(ProcessKind::system("ls", ["-l", "/tmp"]).describe(), "ls -l /tmp");
        assert_eq!(ProcessKind::system("true", Vec::<String>::new()).describe(), "true");
        assert_eq!(ProcessKind::function("upper", upper()).describe(), "fn:upper");
    }

    #[tokio::test]
    async fn test_function_lifecycle() {
        let handle = function_handle(1, upper());
        let (in_tx, in_rx) = channel(16);
        let (out_tx, mut out_rx) = channel(16);
        handle.bind_stdin(in_rx).unwrap();
        handle.bind_stdout(out_tx).unwrap();

        assert_eq!(handle.state(), ProcessState::Ready);
        handle.start().unwrap();
        assert_eq!(handle.state(), ProcessState::Running);

        in_tx.send(b"abc").await.unwrap();
        drop(in_tx);

        let mut out = Vec::new();
        while let Some(chunk) = out_rx.recv().await {
            out.extend(chunk);
        }
        assert_eq!(out, b"ABC");

        let outcome = handle.wait(None).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Terminated { exit_code: Some(0) });
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_double_start_is_state_error() {
        let handle = function_handle(2, forever());
        handle.start().unwrap();

        let err = handle.start().unwrap_err();
        assert!(matches!(err, ShellError::State { op: "start", .. }));
        assert_eq!(handle.state(), ProcessState::Running);

        handle.kill().await.unwrap();
        assert!(matches!(handle.start(), Err(ShellError::State { .. })));
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_bind_after_start_rejected() {
        let handle = function_handle(3, forever());
        handle.start().unwrap();
        let (tx, _rx) = channel(4);
        assert!(handle.bind_stdout(tx).is_err());
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_running() {
        let handle = function_handle(4, forever());
        handle.start().unwrap();

        let outcome = handle.wait(Some(Duration::from_millis(20))).await.unwrap();
        assert!(outcome.is_timed_out());
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.is_alive());

        handle.kill().await.unwrap();
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert_eq!(handle.exit_code(), None);
        // Idempotent.
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_closes_outputs() {
        let handle = function_handle(5, forever());
        let (out_tx, mut out_rx) = channel(4);
        handle.bind_stdout(out_tx).unwrap();
        handle.start().unwrap();
        handle.kill().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_kill_concurrent_with_wait() {
        let handle = Arc::new(function_handle(6, forever()));
        handle.start().unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.kill().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Terminated { exit_code: None });
    }

    #[tokio::test]
    async fn test_function_error_surfaces_on_wait() {
        let failing = stage_fn(|_io: StageIo| async move {
            Err::<i32, _>(ShellError::InvalidStage("nope".into()))
        });
        let handle = function_handle(7, failing);
        handle.start().unwrap();

        let err = handle.wait(None).await.unwrap_err();
        assert!(matches!(err, ShellError::StageFailed { .. }));
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert_eq!(handle.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_ready_handle_cannot_wait_but_kill_is_noop() {
        let handle = function_handle(8, forever());
        assert!(matches!(
            handle.wait(None).await,
            Err(ShellError::State { op: "wait", .. })
        ));
        handle.kill().await.unwrap();
        assert_eq!(handle.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn test_is_alive_tracks_natural_exit() {
        let quick = stage_fn(|_io: StageIo| async move { Ok::<_, ShellError>(3) });
        let handle = function_handle(9, quick);
        handle.start().unwrap();

        for _ in 0..100 {
            if !handle.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_alive());
        // Cached state only moves on wait.
        assert_eq!(handle.state(), ProcessState::Running);
        assert_eq!(handle.wait(None).await.unwrap().exit_code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_process_exit_code_and_pid() {
        let spec = ProcessSpec::new(
            ProcessKind::system("sh", ["-c", "exit 7"]),
            BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
            std::env::temp_dir(),
        );
        let handle = ProcessHandle::new(VirtualId(10), spec, 64);
        handle.start().unwrap();
        assert!(handle.os_pid().is_some());

        let outcome = handle.wait(None).await.unwrap();
        assert_eq!(outcome.exit_code(), Some(7));
        assert_eq!(handle.status().exit_code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_kill_reports_signal_code() {
        let spec = ProcessSpec::new(
            ProcessKind::system("sleep", ["30"]),
            BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
            std::env::temp_dir(),
        );
        let handle = ProcessHandle::new(VirtualId(11), spec, 64);
        handle.start().unwrap();
        assert!(handle.is_alive());

        handle.kill().await.unwrap();
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert_eq!(handle.exit_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn test_spawn_failure_stays_ready() {
        let spec = ProcessSpec::new(
            ProcessKind::system("/definitely/not/a/binary", Vec::<String>::new()),
            BTreeMap::new(),
            std::env::temp_dir(),
        );
        let handle = ProcessHandle::new(VirtualId(12), spec, 64);
        let (writer, mut reader) = channel(8);
        let (upstream, input) = channel(8);
        handle.bind_stdin(input).unwrap();
        handle.bind_stdout(writer).unwrap();
        assert!(matches!(handle.start(), Err(ShellError::Spawn { .. })));
        assert_eq!(handle.state(), ProcessState::Ready);

        let released = handle.release_bindings();
        assert!(released.stderr.is_none());
        let mut input = released.stdin.expect("stdin stays bound after spawn failure");
        upstream.send(b"back").await.unwrap();
        drop(upstream);
        assert_eq!(input.recv().await.as_deref(), Some(&b"back"[..]));

        drop(released.stdout);
        assert_eq!(reader.recv().await, None);
        assert!(handle.release_bindings().stdin.is_none());
    }

    #[tokio::test]
    async fn test_release_bindings_after_start_is_empty() {
        let handle = function_handle(13, upper());
        let (_writer, input) = channel(8);
        handle.bind_stdin(input).unwrap();
        handle.start().unwrap();

        let released = handle.release_bindings();
        assert!(released.stdin.is_none());
        assert!(released.stdout.is_none());
        handle.kill().await.unwrap();
    }
}
