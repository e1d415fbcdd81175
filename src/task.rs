//! Task records and the status state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is staged and waiting for a running slot.
    Queued,
    /// Task's process is executing.
    Running,
    /// Process exited with code zero.
    Succeeded,
    /// Process exited non-zero, or could not be started.
    Failed,
    /// Task was cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Cancelled) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One tracked invocation of a registered script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Name of the registered script this task runs.
    pub script_name: String,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the task was admitted for execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code of the process (absent for cancelled tasks and spawn
    /// failures).
    pub exit_code: Option<i32>,
    /// Isolated directory holding the task's script, inputs, and outputs.
    pub task_dir: PathBuf,
}

impl Task {
    /// Create a new queued task.
    pub fn new(id: Uuid, script_name: impl Into<String>, task_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            script_name: script_name.into(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            task_dir: task_dir.into(),
        }
    }

    /// Apply a status transition, updating timestamps. Returns an error
    /// string if the transition is not allowed by the state machine.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }

        self.status = target;
        match target {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled => {
                if self.ended_at.is_none() {
                    self.ended_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        Ok(())
    }
}
