//! weir-kernel: the pipeline execution engine behind weir.
//!
//! This crate provides:
//!
//! - **Channel**: Bounded byte channels with backpressure and close-on-drop
//! - **IoBuffer**: Relay between OS pipes and stage channels
//! - **Process**: Handles for OS processes and in-process functions, each
//!   with a forward-only READY → RUNNING → TERMINATED lifecycle
//! - **Registry**: Virtual id allocation plus bulk wait/kill
//! - **Pipeline**: Builder that wires sources, process stages and sinks
//! - **Shell**: Scoped environment, variables and working directory
//!
//! ```text
//! ShellContext ──command()/function()──▶ ProcessRegistry ──▶ ProcessHandle
//!      │                                        ▲
//!      └──pipeline(source)──▶ Pipeline ─────────┘ start / wait / kill
//!                                │
//!              source ─▶ [chan] ─▶ stage ─▶ [chan] ─▶ sink
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod io_buffer;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod shell;
pub mod stage;

pub use channel::{
    channel, closed_reader, null_writer, ChannelReader, ChannelWriter, DEFAULT_CHANNEL_CAPACITY,
};
pub use config::ShellConfig;
pub use error::{ShellError, ShellResult};
pub use io_buffer::IoBuffer;
pub use pipeline::Pipeline;
pub use process::{
    stage_fn, ProcessHandle, ProcessKind, ProcessSpec, StageFn, StageIo, WaitOutcome,
};
pub use registry::ProcessRegistry;
pub use shell::ShellContext;
pub use stage::{Accumulator, ByteSink, ByteSource, Source, Stage};

// Shared data types, for embedders that only depend on the kernel.
pub use weir_types::{ProcessState, ProcessStatus, VirtualId};
