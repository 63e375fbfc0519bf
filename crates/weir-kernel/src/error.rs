//! Error taxonomy for the pipeline engine.
//!
//! Validation errors (`State`, `UnknownHandle`, `PipelineClosed`, `Directory`)
//! are returned at the offending call. Failures inside spawned stage tasks are
//! captured and come back as `StageFailed` when the owning pipeline is awaited.

use std::path::PathBuf;

use thiserror::Error;
use weir_types::{ProcessState, VirtualId};

/// Result type for engine operations.
pub type ShellResult<T> = Result<T, ShellError>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("process {id}: cannot {op} while {state}")]
    State {
        id: VirtualId,
        op: &'static str,
        state: ProcessState,
    },
    #[error("unknown process id: {0}")]
    UnknownHandle(VirtualId),
    #[error("pipeline is closed: a terminal sink is already attached")]
    PipelineClosed,
    #[error("not a directory: {}", .0.display())]
    Directory(PathBuf),
    #[error("process {id}: failed to destroy: {reason}")]
    ProcessDestroy { id: VirtualId, reason: String },
    #[error("{command}: spawn failed: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },
    #[error("invalid stage: {0}")]
    InvalidStage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    pub(crate) fn stage(stage: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ShellError::StageFailed {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = ShellError::State {
            id: VirtualId(4),
            op: "start",
            state: ProcessState::Running,
        };
        assert_eq!(err.to_string(), "process 4: cannot start while RUNNING");

        let err = ShellError::Directory(PathBuf::from("/no/such"));
        assert_eq!(err.to_string(), "not a directory: /no/such");

        let err = ShellError::stage("grep", "boom");
        assert_eq!(err.to_string(), "stage grep failed: boom");
    }
}
