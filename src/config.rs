//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base directory holding `scripts/` and `tasks/`.
    pub base_dir: PathBuf,
    /// Maximum number of tasks running at any instant.
    pub max_concurrent: usize,
    /// Interpreter used to run registered scripts.
    pub interpreter: String,
    /// Grace period between the graceful termination signal and the
    /// forceful kill during cancellation.
    pub grace_period: Duration,
}

impl EngineConfig {
    /// Create a config rooted at `base_dir` with default settings.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "interpreter".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Directory holding registered scripts.
    pub fn scripts_dir(&self) -> PathBuf {
        self.base_dir.join("scripts")
    }

    /// Directory holding per-task directories.
    pub fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".runq"),
            max_concurrent: 5,
            interpreter: "python3".to_string(),
            grace_period: Duration::from_secs(10),
        }
    }
}
