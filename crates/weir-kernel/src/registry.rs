//! Process registry: creates, tracks, starts, awaits and kills handles.
//!
//! One registry exists per top-level shell and is shared by every sub-shell
//! and pipeline created from it, so a single `wait_all`/`kill_all` reaches
//! all work started anywhere in that tree.
//!
//! Entries are never removed. Terminated handles stay queryable until the
//! registry itself is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use weir_types::{ProcessState, ProcessStatus, VirtualId};

use crate::channel::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{ShellError, ShellResult};
use crate::process::{ProcessHandle, ProcessSpec, WaitOutcome};

/// Registry of process handles keyed by virtual id.
pub struct ProcessRegistry {
    /// Counter for generating unique ids.
    next_id: AtomicU64,
    /// Handles by id. Ordered so snapshots come out in creation order.
    handles: RwLock<BTreeMap<VirtualId, Arc<ProcessHandle>>>,
    /// Capacity of the relay buffers behind OS process pipes.
    relay_capacity: usize,
}

impl ProcessRegistry {
    /// Create a registry with the default relay capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a registry whose handles relay OS output through buffers of
    /// `relay_capacity` bytes.
    pub fn with_capacity(relay_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(BTreeMap::new()),
            relay_capacity: relay_capacity.max(1),
        }
    }

    /// Register a new handle without starting it.
    pub fn create_process(&self, spec: ProcessSpec) -> Arc<ProcessHandle> {
        // Id allocation and insertion happen under the write lock so that
        // iteration order always matches id order.
        let mut handles = self.write();
        let id = VirtualId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(ProcessHandle::new(id, spec, self.relay_capacity));
        handles.insert(id, handle.clone());
        tracing::debug!(%id, command = %handle.command(), "registered process");
        handle
    }

    /// Look up a handle by id.
    pub fn get(&self, id: VirtualId) -> ShellResult<Arc<ProcessHandle>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(ShellError::UnknownHandle(id))
    }

    /// Start a registered handle.
    pub fn start_process(&self, id: VirtualId) -> ShellResult<()> {
        self.get(id)?.start()
    }

    /// Wait for a registered handle. `None` or zero waits indefinitely.
    pub async fn wait_process(
        &self,
        id: VirtualId,
        timeout: Option<Duration>,
    ) -> ShellResult<WaitOutcome> {
        let handle = self.get(id)?;
        handle.wait(timeout).await
    }

    /// Kill a registered handle.
    pub async fn kill_process(&self, id: VirtualId) -> ShellResult<()> {
        let handle = self.get(id)?;
        handle.kill().await
    }

    /// Wait for every started handle. Handles that never started are
    /// skipped. Every handle is waited on even if some fail; the first
    /// error is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_all(&self) -> ShellResult<()> {
        let mut first_err = None;
        for handle in self.handles() {
            if handle.state() == ProcessState::Ready {
                continue;
            }
            if let Err(e) = handle.wait(None).await {
                tracing::debug!(id = %handle.id(), "wait failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Kill every handle. Every handle is attempted; the first error is
    /// returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn kill_all(&self) -> ShellResult<()> {
        let mut first_err = None;
        for handle in self.handles() {
            if let Err(e) = handle.kill().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Snapshot of every handle, in id order.
    pub fn status(&self) -> Vec<ProcessStatus> {
        self.handles().iter().map(|h| h.status()).collect()
    }

    /// All handles, in id order. The lock is released before returning.
    pub fn handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<VirtualId, Arc<ProcessHandle>>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<VirtualId, Arc<ProcessHandle>>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{stage_fn, ProcessKind, StageIo};

    fn spec(name: &str) -> ProcessSpec {
        let forever = stage_fn(|_io: StageIo| async move {
            std::future::pending::<()>().await;
            Ok::<_, ShellError>(0)
        });
        ProcessSpec::new(
            ProcessKind::function(name, forever),
            BTreeMap::new(),
            std::env::temp_dir(),
        )
    }

    fn quick(name: &str, code: i32) -> ProcessSpec {
        let f = stage_fn(move |_io: StageIo| async move { Ok::<_, ShellError>(code) });
        ProcessSpec::new(ProcessKind::function(name, f), BTreeMap::new(), std::env::temp_dir())
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let registry = ProcessRegistry::new();
        let a = registry.create_process(spec("a"));
        let b = registry.create_process(spec("b"));
        assert_eq!(a.id(), VirtualId(1));
        assert_eq!(b.id(), VirtualId(2));
        assert_eq!(a.state(), ProcessState::Ready);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_unique_ordered_ids() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut tasks = Vec::new();
        for t in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..50 {
                    ids.push(registry.create_process(spec(&format!("{}-{}", t, i))).id());
                }
                ids
            }));
        }

        for task in tasks {
            let ids = task.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids per caller must increase");
        }

        let all: Vec<VirtualId> = registry.status().iter().map(|s| s.id).collect();
        assert_eq!(all.len(), 400);
        assert_eq!(all, (1..=400).map(VirtualId).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let registry = ProcessRegistry::new();
        assert!(matches!(
            registry.start_process(VirtualId(42)),
            Err(ShellError::UnknownHandle(VirtualId(42)))
        ));
        assert!(matches!(
            registry.wait_process(VirtualId(42), None).await,
            Err(ShellError::UnknownHandle(_))
        ));
        assert!(matches!(
            registry.kill_process(VirtualId(42)).await,
            Err(ShellError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_wait_by_id() {
        let registry = ProcessRegistry::new();
        let handle = registry.create_process(quick("five", 5));
        registry.start_process(handle.id()).unwrap();

        let outcome = registry.wait_process(handle.id(), None).await.unwrap();
        assert_eq!(outcome.exit_code(), Some(5));
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_kill_all_terminates_running_stages() {
        let registry = ProcessRegistry::new();
        let handles: Vec<_> = (0..3).map(|i| registry.create_process(spec(&i.to_string()))).collect();
        for handle in &handles {
            registry.start_process(handle.id()).unwrap();
        }

        registry.kill_all().await.unwrap();

        for handle in &handles {
            assert_eq!(handle.state(), ProcessState::Terminated);
        }
    }

    #[tokio::test]
    async fn test_wait_all_skips_unstarted() {
        let registry = ProcessRegistry::new();
        let started = registry.create_process(quick("started", 0));
        let idle = registry.create_process(quick("idle", 0));
        started.start().unwrap();

        registry.wait_all().await.unwrap();

        assert_eq!(started.state(), ProcessState::Terminated);
        assert_eq!(idle.state(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let registry = ProcessRegistry::new();
        let a = registry.create_process(quick("a", 2));
        let _b = registry.create_process(spec("b"));
        a.start().unwrap();
        a.wait(None).await.unwrap();

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].command, "fn:a");
        assert_eq!(status[0].state, ProcessState::Terminated);
        assert_eq!(status[0].exit_code, Some(2));
        assert_eq!(status[1].state, ProcessState::Ready);
        assert_eq!(status[1].elapsed, Duration::ZERO);
    }
}
