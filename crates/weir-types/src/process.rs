//! Process identification and lifecycle types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Registry-assigned identifier for a process handle.
///
/// Independent of any OS pid. Ids are handed out in strictly increasing
/// order by one registry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualId(pub u64);

impl std::fmt::Display for VirtualId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for VirtualId {
    fn from(value: u64) -> Self {
        VirtualId(value)
    }
}

/// Lifecycle state held in a process control block.
///
/// Only moves forward: `Ready` → `Running` → `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Created but not started.
    Ready,
    /// Started; the underlying work may or may not still be alive.
    Running,
    /// Awaited or killed. Final.
    Terminated,
}

impl ProcessState {
    /// Whether `next` is the single legal successor of this state.
    pub fn can_advance_to(self, next: ProcessState) -> bool {
        matches!(
            (self, next),
            (ProcessState::Ready, ProcessState::Running)
                | (ProcessState::Running, ProcessState::Terminated)
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Ready => write!(f, "READY"),
            ProcessState::Running => write!(f, "RUNNING"),
            ProcessState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Read-only snapshot of one registered process, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Virtual id.
    pub id: VirtualId,
    /// Command line or function name.
    pub command: String,
    /// State at the time of the snapshot.
    pub state: ProcessState,
    /// Time spent running: start → end, or start → now while running.
    pub elapsed: Duration,
    /// Exit code, once terminated.
    pub exit_code: Option<i32>,
    /// OS pid, for OS-backed handles that have started.
    pub os_pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(ProcessState::Ready.can_advance_to(ProcessState::Running));
        assert!(ProcessState::Running.can_advance_to(ProcessState::Terminated));
        assert!(!ProcessState::Ready.can_advance_to(ProcessState::Terminated));
        assert!(!ProcessState::Terminated.can_advance_to(ProcessState::Running));
        assert!(!ProcessState::Running.can_advance_to(ProcessState::Running));
    }

    #[test]
    fn test_ids_order() {
        assert!(VirtualId(1) < VirtualId(2));
        assert_eq!(VirtualId::from(7).to_string(), "7");
    }

    #[test]
    fn test_status_serializes_state_lowercase() {
        let status = ProcessStatus {
            id: VirtualId(3),
            command: "cat -n".to_string(),
            state: ProcessState::Running,
            elapsed: Duration::from_millis(5),
            exit_code: None,
            os_pid: Some(4242),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["state"], "running");
        assert_eq!(json["command"], "cat -n");
    }
}
