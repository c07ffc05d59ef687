//! Engine configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a writer waits for a row lock. Zero fails contended writes
    /// immediately with `LockConflict`.
    pub lock_wait_timeout_ms: u64,
    /// Commits between automatic garbage collection runs; zero disables them.
    pub gc_interval: u64,
    /// Reject lock waits that would close a cycle in the wait-for graph.
    pub deadlock_detection: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 1000,
            gc_interval: 128,
            deadlock_detection: true,
        }
    }
}

impl EngineConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_gc_interval(mut self, commits: u64) -> Self {
        self.gc_interval = commits;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
