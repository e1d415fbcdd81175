//! `TaskStore` trait, the single async interface for task persistence.
//!
//! The engine depends only on this trait; the concrete backend (in-memory,
//! SQL, ...) is an external collaborator. Implementations must preserve
//! creation order in `list()` and reject transitions out of terminal
//! statuses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{Task, TaskStatus};

/// Backend-agnostic store for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a newly created task.
    async fn create(&self, task: Task) -> Result<(), StoreError>;

    /// Apply a status transition, recording the exit code and timestamps
    /// when present. Returns the updated record.
    ///
    /// Must fail with `StoreError::InvalidTransition` if the state machine
    /// does not allow `status` from the task's current status.
    async fn update(
        &self,
        id: Uuid,
        status: TaskStatus,
        exit_code: Option<i32>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<Task, StoreError>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// All tasks ordered by creation time.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}
