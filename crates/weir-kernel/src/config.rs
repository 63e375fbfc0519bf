//! Shell configuration.

use std::path::PathBuf;

use crate::channel::DEFAULT_CHANNEL_CAPACITY;

/// Configuration for a top-level shell context.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Name of this shell (for identification in logs).
    pub name: String,

    /// Initial working directory.
    pub cwd: PathBuf,

    /// Capacity in bytes of every channel between pipeline stages, and of
    /// the relay buffers behind OS process pipes.
    pub channel_capacity: usize,

    /// Seed the root environment from the host process environment.
    pub inherit_env: bool,
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            cwd: current_dir(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            inherit_env: true,
        }
    }
}

impl ShellConfig {
    /// Create a config with the given name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Create a config with an empty environment, rooted at `/`.
    ///
    /// Useful for tests that must not depend on the host environment.
    pub fn isolated() -> Self {
        Self {
            name: "isolated".to_string(),
            cwd: PathBuf::from("/"),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            inherit_env: false,
        }
    }

    /// Set the initial working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Set the channel capacity. Zero is raised to one.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set whether the host environment is inherited.
    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.channel_capacity, 512);
        assert!(config.inherit_env);
    }

    #[test]
    fn test_isolated() {
        let config = ShellConfig::isolated();
        assert!(!config.inherit_env);
        assert_eq!(config.cwd, PathBuf::from("/"));
    }

    #[test]
    fn test_builders() {
        let config = ShellConfig::named("build")
            .with_cwd("/tmp")
            .with_channel_capacity(0)
            .with_inherit_env(false);
        assert_eq!(config.name, "build");
        assert_eq!(config.cwd, PathBuf::from("/tmp"));
        assert_eq!(config.channel_capacity, 1);
        assert!(!config.inherit_env);
    }
}
