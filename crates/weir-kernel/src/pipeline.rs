//! Pipeline builder and executor.
//!
//! Stages are wired left to right over bounded channels, and each one starts
//! running as soon as it is attached.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              Pipeline                                │
//! │  ┌────────┐  channel  ┌─────────┐  channel  ┌─────────┐  ┌────────┐  │
//! │  │ source │──────────▶│ stage 1 │──────────▶│ stage 2 │─▶│  sink  │  │
//! │  │ (task) │  N bytes  │ (proc)  │  N bytes  │ (proc)  │  │ (task) │  │
//! │  └────────┘           └─────────┘           └─────────┘  └────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - A full channel suspends the stage writing into it; an empty one
//!   suspends the stage reading from it.
//! - When a stage's input ends it finishes and closes its output, so
//!   end-of-stream cascades down to the sink, which then finalizes.
//! - Attaching a terminal sink closes the pipeline; it stays awaitable and
//!   killable but accepts no more stages.
//! - `wait` and `kill` cover every process handle and every task the
//!   pipeline created, including ones that already finished.

use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::channel::{channel, ChannelReader, ChannelWriter};
use crate::error::{ShellError, ShellResult};
use crate::process::ProcessHandle;
use crate::registry::ProcessRegistry;
use crate::stage::{ByteSink, ByteSource, Source, Stage};
use weir_types::ProcessState;

/// A relay task owned by the pipeline.
struct StageTask {
    name: String,
    handle: JoinHandle<ShellResult<()>>,
}

/// A chain of stages connected by bounded channels.
pub struct Pipeline {
    registry: Arc<ProcessRegistry>,
    capacity: usize,
    processes: Vec<Arc<ProcessHandle>>,
    tasks: Vec<StageTask>,
    /// Output of the last stage, until a sink or the caller takes it.
    output: Option<ChannelReader>,
    closed: bool,
}

impl Pipeline {
    /// Start a pipeline at `source`.
    ///
    /// A process source is started right away with its stdout captured;
    /// any other source gets a task that pumps it into the first channel.
    /// Every channel in the pipeline holds `capacity` bytes.
    pub fn from_source(
        registry: Arc<ProcessRegistry>,
        capacity: usize,
        source: impl Into<Source>,
    ) -> ShellResult<Self> {
        let mut pipeline = Self {
            registry,
            capacity: capacity.max(1),
            processes: Vec::new(),
            tasks: Vec::new(),
            output: None,
            closed: false,
        };

        let source = source.into();
        let name = source.describe();
        let (writer, reader) = channel(pipeline.capacity);

        match source.into_byte_source() {
            Err(handle) => {
                pipeline
                    .start_stage(&handle, None, writer, None)
                    .map_err(|(err, _)| err)?;
                pipeline.processes.push(handle);
            }
            Ok(byte_source) => {
                tracing::debug!(source = %name, "spawning source pump");
                pipeline.spawn_task(name, pump_source(byte_source, writer));
            }
        }

        pipeline.output = Some(reader);
        Ok(pipeline)
    }

    /// Attach the next stage.
    ///
    /// A process is started reading the previous output and writing a fresh
    /// channel. Any other stage is a terminal sink and closes the pipeline.
    ///
    /// Attaching is all-or-nothing: if a process stage cannot be started,
    /// the error is returned and the pipeline is left as it was.
    pub fn pipe(&mut self, stage: impl Into<Stage>) -> ShellResult<&mut Self> {
        let stage = stage.into();
        let name = stage.describe();
        match stage.into_byte_sink() {
            Err(handle) => self.attach_process(handle, None)?,
            Ok(sink) => {
                let input = self.take_input()?;
                tracing::debug!(sink = %name, "attached terminal sink");
                self.spawn_task(name, drain_to_sink(input, sink));
                self.closed = true;
            }
        }
        Ok(self)
    }

    /// Attach a process stage.
    pub fn through(&mut self, handle: Arc<ProcessHandle>) -> ShellResult<&mut Self> {
        self.pipe(Stage::Process(handle))
    }

    /// Attach a process stage whose stderr is diverted into `stderr_sink`.
    ///
    /// The diverted stream gets its own bounded channel and its own task;
    /// the primary stdout chain continues as with [`Pipeline::through`].
    /// There is no ordering between the two branches. The branch ends when
    /// the process closes its stderr and is joined or cancelled with the
    /// rest of the pipeline.
    pub fn through_forked(
        &mut self,
        handle: Arc<ProcessHandle>,
        stderr_sink: impl Into<Stage>,
    ) -> ShellResult<&mut Self> {
        self.ensure_open()?;
        let sink = stderr_sink
            .into()
            .into_byte_sink()
            .map_err(|_| ShellError::InvalidStage("stderr fork target must be a sink".into()))?;

        // The branch task only exists once the stage is running; on failure
        // both ends of the branch channel are dropped.
        let (writer, reader) = channel(self.capacity);
        self.attach_process(handle.clone(), Some(writer))?;
        let name = format!("stderr of {}", handle.command());
        self.spawn_task(name, drain_to_sink(reader, sink));
        Ok(self)
    }

    /// Attach a terminal sink.
    pub fn to(&mut self, sink: impl Into<Stage>) -> ShellResult<&mut Self> {
        let sink = sink.into();
        if !sink.is_terminal() {
            return Err(ShellError::InvalidStage(format!(
                "{} is not a sink; use through()",
                sink.describe()
            )));
        }
        self.pipe(sink)
    }

    /// Take the output of the last stage, leaving the pipeline without one.
    /// Further stages cannot be attached afterwards.
    pub fn take_output(&mut self) -> Option<ChannelReader> {
        self.output.take()
    }

    /// Whether a terminal sink is attached.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process handles in chain order.
    pub fn processes(&self) -> &[Arc<ProcessHandle>] {
        &self.processes
    }

    /// Exit code of the last process stage, once terminated.
    pub fn exit_code(&self) -> Option<i32> {
        self.processes.last().and_then(|h| h.exit_code())
    }

    /// Wait for every process and join every task.
    ///
    /// If no sink was attached and the output was not taken, the output is
    /// drained and discarded so the chain can finish. Errors from processes
    /// or tasks are collected; the first one is returned after everything
    /// has been waited on.
    #[tracing::instrument(level = "debug", skip(self), fields(processes = self.processes.len(), tasks = self.tasks.len()))]
    pub async fn wait(&mut self) -> ShellResult<()> {
        if let Some(output) = self.output.take() {
            tracing::debug!("discarding unconsumed pipeline output");
            self.spawn_task("discard".to_string(), discard(output));
        }

        let mut first_err = None;
        for handle in &self.processes {
            if let Err(e) = self.registry.wait_process(handle.id(), None).await {
                tracing::debug!(id = %handle.id(), "stage failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        for task in std::mem::take(&mut self.tasks) {
            let result = match task.handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ShellError::stage(&task.name, e)),
                Err(e) => {
                    tracing::warn!(stage = %task.name, "stage task did not complete: {}", e);
                    Err(ShellError::stage(&task.name, e))
                }
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Kill every process and cancel every task.
    ///
    /// Safe to call while stages are blocked on full or empty channels and
    /// after some have finished. Every process is attempted; the first kill
    /// error is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(processes = self.processes.len(), tasks = self.tasks.len()))]
    pub async fn kill(&mut self) -> ShellResult<()> {
        self.output = None;

        let mut first_err = None;
        for handle in &self.processes {
            if let Err(e) = self.registry.kill_process(handle.id()).await {
                first_err.get_or_insert(e);
            }
        }

        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.handle.abort();
        }
        for task in tasks {
            // Cancelled, or finished before the abort landed; either way the
            // task has released its channel ends.
            let _ = task.handle.await;
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Wire `handle` after the current tail and start it.
    fn attach_process(
        &mut self,
        handle: Arc<ProcessHandle>,
        stderr: Option<ChannelWriter>,
    ) -> ShellResult<()> {
        self.ensure_open()?;
        self.ensure_startable(&handle)?;

        let input = self.take_input()?;
        let (writer, reader) = channel(self.capacity);
        if let Err((err, input)) = self.start_stage(&handle, Some(input), writer, stderr) {
            // A reader lost to a concurrent start was dropped with it, so the
            // upstream stage sees BrokenPipe instead of blocking.
            self.output = input;
            return Err(err);
        }

        tracing::debug!(id = %handle.id(), stage = %handle.command(), "attached process stage");
        self.processes.push(handle);
        self.output = Some(reader);
        Ok(())
    }

    /// Bind the given channels and start `handle`. On failure every binding
    /// made here is taken back and the stdin reader is returned to the caller.
    fn start_stage(
        &self,
        handle: &Arc<ProcessHandle>,
        stdin: Option<ChannelReader>,
        stdout: ChannelWriter,
        stderr: Option<ChannelWriter>,
    ) -> Result<(), (ShellError, Option<ChannelReader>)> {
        let forked = stderr.is_some();
        let started = self
            .ensure_startable(handle)
            .and_then(|()| bind_all(handle, stdin, stdout, stderr))
            .and_then(|()| handle.start());

        started.map_err(|err| {
            tracing::debug!(id = %handle.id(), "stage failed to start: {}", err);
            let released = handle.release_bindings();
            if !forked {
                // Not ours; put it back.
                if let Some(stderr) = released.stderr {
                    let _ = handle.bind_stderr(stderr);
                }
            }
            (err, released.stdin)
        })
    }

    /// The handle must belong to this pipeline's registry and be READY.
    fn ensure_startable(&self, handle: &Arc<ProcessHandle>) -> ShellResult<()> {
        let registered = self.registry.get(handle.id())?;
        if !Arc::ptr_eq(&registered, handle) {
            return Err(ShellError::UnknownHandle(handle.id()));
        }
        let state = handle.state();
        if state != ProcessState::Ready {
            return Err(ShellError::State {
                id: handle.id(),
                op: "attach",
                state,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> ShellResult<()> {
        if self.closed {
            return Err(ShellError::PipelineClosed);
        }
        if self.output.is_none() {
            return Err(ShellError::InvalidStage(
                "pipeline output was taken; no stage can follow".into(),
            ));
        }
        Ok(())
    }

    fn take_input(&mut self) -> ShellResult<ChannelReader> {
        self.ensure_open()?;
        self.output
            .take()
            .ok_or_else(|| ShellError::InvalidStage("pipeline has no output".into()))
    }

    fn spawn_task<F>(&mut self, name: String, future: F)
    where
        F: std::future::Future<Output = ShellResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(StageTask { name, handle });
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("capacity", &self.capacity)
            .field("processes", &self.processes)
            .field("tasks", &self.tasks.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("closed", &self.closed)
            .finish()
    }
}

fn bind_all(
    handle: &ProcessHandle,
    stdin: Option<ChannelReader>,
    stdout: ChannelWriter,
    stderr: Option<ChannelWriter>,
) -> ShellResult<()> {
    if let Some(stdin) = stdin {
        handle.bind_stdin(stdin)?;
    }
    handle.bind_stdout(stdout)?;
    if let Some(stderr) = stderr {
        handle.bind_stderr(stderr)?;
    }
    Ok(())
}

/// Pump a source into `writer` until the source is exhausted, then close.
///
/// A downstream stage that stops reading early is not an error; the pump
/// just stops.
async fn pump_source(mut source: Box<dyn ByteSource>, writer: ChannelWriter) -> ShellResult<()> {
    loop {
        // A source can block indefinitely (an idle stdin); stop as soon as
        // nobody is listening.
        let chunk = tokio::select! {
            chunk = source.next_chunk() => chunk?,
            _ = writer.closed() => None,
        };
        let Some(chunk) = chunk else { break };
        match writer.send(&chunk).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::trace!(source = %source.describe(), "downstream closed early");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
    writer.close();
    Ok(())
}

/// Drain `reader` into `sink` until end-of-stream, then finalize the sink.
async fn drain_to_sink(mut reader: ChannelReader, mut sink: Box<dyn ByteSink>) -> ShellResult<()> {
    while let Some(chunk) = reader.recv().await {
        sink.write(&chunk).await?;
    }
    sink.finish().await?;
    Ok(())
}

async fn discard(mut reader: ChannelReader) -> ShellResult<()> {
    while reader.recv().await.is_some() {}
    Ok(())
}
