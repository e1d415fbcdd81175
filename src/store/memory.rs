//! In-memory task store, the reference backend used in tests and
//! single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::task::{Task, TaskStatus};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    /// Insertion order, so `list()` reflects creation time.
    order: Vec<Uuid>,
}

/// In-memory `TaskStore` backend.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate { id: task.id });
        }
        inner.order.push(task.id);
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn update(
        &self,
        id: Uuid,
        status: TaskStatus,
        exit_code: Option<i32>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::NotFound { id })?;

        let from = task.status;
        task.transition_to(status)
            .map_err(|_| StoreError::InvalidTransition {
                id,
                from: from.to_string(),
                to: status.to_string(),
            })?;

        if let Some(code) = exit_code {
            task.exit_code = Some(code);
        }
        if let Some(at) = started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = ended_at {
            task.ended_at = Some(at);
        }
        Ok(task.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }
}
