//! Shell contexts: scoped environment, variables and working directory.
//!
//! A context owns:
//! - An environment map, copied into every sub-shell and every process it
//!   creates
//! - A variable map, local to this context and never inherited
//! - A working directory
//!
//! All contexts in one tree share a single [`ProcessRegistry`], so the root's
//! `wait_all`/`kill_all` reaches processes created by any sub-shell.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use weir_types::ProcessStatus;

use crate::config::ShellConfig;
use crate::error::{ShellError, ShellResult};
use crate::pipeline::Pipeline;
use crate::process::{ProcessHandle, ProcessKind, ProcessSpec, StageFn};
use crate::registry::ProcessRegistry;
use crate::stage::Source;

/// One scope in a tree of shell contexts.
#[derive(Debug, Clone)]
pub struct ShellContext {
    registry: Arc<ProcessRegistry>,
    config: Arc<ShellConfig>,
    env: BTreeMap<String, String>,
    vars: BTreeMap<String, String>,
    cwd: PathBuf,
}

impl ShellContext {
    /// Create a root context with its own registry.
    pub fn new(config: ShellConfig) -> Self {
        let env = if config.inherit_env {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };
        let registry = Arc::new(ProcessRegistry::with_capacity(config.channel_capacity));
        tracing::debug!(name = %config.name, cwd = %config.cwd.display(), "new shell context");
        Self {
            registry,
            cwd: config.cwd.clone(),
            config: Arc::new(config),
            env,
            vars: BTreeMap::new(),
        }
    }

    /// Set an environment entry, visible here and in sub-shells created
    /// afterwards.
    pub fn export(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Set a variable local to this context.
    pub fn variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Remove `key` from both the environment and the variables.
    pub fn unset(&mut self, key: &str) {
        self.env.remove(key);
        self.vars.remove(key);
    }

    /// Change this context's working directory. Relative paths resolve
    /// against the current one.
    pub fn cd(&mut self, dir: impl AsRef<Path>) -> ShellResult<()> {
        let target = self.resolve(dir.as_ref());
        if !target.is_dir() {
            return Err(ShellError::Directory(target));
        }
        self.cwd = target;
        Ok(())
    }

    /// Look up a name. Variables shadow environment entries.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .or_else(|| self.env.get(key))
            .map(String::as_str)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Create a sub-shell in the same working directory.
    pub fn subshell(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            config: self.config.clone(),
            env: self.env.clone(),
            vars: BTreeMap::new(),
            cwd: self.cwd.clone(),
        }
    }

    /// Create a sub-shell starting in `dir`.
    pub fn subshell_in(&self, dir: impl AsRef<Path>) -> ShellResult<Self> {
        let mut child = self.subshell();
        child.cd(dir)?;
        Ok(child)
    }

    /// Register an OS command with this context's environment and directory.
    /// The handle is not started.
    pub fn command<I, S>(&self, program: impl Into<String>, args: I) -> Arc<ProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spawn_spec(ProcessKind::system(program, args))
    }

    /// Register an in-process function stage. The handle is not started.
    pub fn function(&self, name: impl Into<String>, func: Arc<dyn StageFn>) -> Arc<ProcessHandle> {
        self.spawn_spec(ProcessKind::function(name, func))
    }

    /// Begin a pipeline at `source`.
    pub fn pipeline(&self, source: impl Into<Source>) -> ShellResult<Pipeline> {
        Pipeline::from_source(self.registry.clone(), self.config.channel_capacity, source)
    }

    /// Wait for every started process in the whole context tree.
    pub async fn wait_all(&self) -> ShellResult<()> {
        self.registry.wait_all().await
    }

    /// Kill every process in the whole context tree.
    pub async fn kill_all(&self) -> ShellResult<()> {
        self.registry.kill_all().await
    }

    pub fn status(&self) -> Vec<ProcessStatus> {
        self.registry.status()
    }

    fn spawn_spec(&self, kind: ProcessKind) -> Arc<ProcessHandle> {
        let spec = ProcessSpec::new(kind, self.env.clone(), self.cwd.clone());
        self.registry.create_process(spec)
    }

    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.cwd.join(dir)
        }
    }
}

impl Default for ShellContext {
    fn default() -> Self {
        Self::new(ShellConfig::default())
    }
}
