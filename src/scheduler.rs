//! Concurrency scheduler: a FIFO queue plus a bounded running set.
//!
//! `SchedulerState` is plain data with synchronous operations; the engine
//! wraps it in a single `tokio::sync::Mutex`, which is the serialization
//! domain for every admission, release, enqueue, and cancellation-removal.
//! Nothing here touches the store or spawns processes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CancelError;

/// Per-running-task handles shared between the supervisor and the
/// cancellation controller.
#[derive(Debug, Clone)]
pub struct RunningSlot {
    /// Triggered to request termination of the task's process.
    pub cancel: CancellationToken,
    /// Triggered by the supervisor once the task is finalized.
    pub done: CancellationToken,
    /// Set by the supervisor before `done` if termination could not be
    /// confirmed; cancellers surface it instead of a status.
    pub fatal: Arc<OnceLock<CancelError>>,
}

impl RunningSlot {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            fatal: Arc::new(OnceLock::new()),
        }
    }
}

/// Queue membership and running-count state.
pub struct SchedulerState {
    max_concurrent: usize,
    queue: VecDeque<Uuid>,
    running: HashMap<Uuid, RunningSlot>,
}

impl SchedulerState {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            queue: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    /// Append a task to the tail of the admission queue.
    pub fn enqueue(&mut self, id: Uuid) {
        self.queue.push_back(id);
    }

    /// Admit queued tasks head-first while slots are free. Returns the
    /// admitted ids with their freshly allocated slots, in admission order.
    pub fn admit_next(&mut self) -> Vec<(Uuid, RunningSlot)> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrent {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let slot = RunningSlot::new();
            self.running.insert(id, slot.clone());
            admitted.push((id, slot));
        }
        admitted
    }

    /// Release a running task's slot. Releasing an id that is not running
    /// is a slot-accounting bug, not a user-facing condition.
    pub fn release(&mut self, id: Uuid) {
        if self.running.remove(&id).is_none() {
            tracing::error!(task_id = %id, "Slot release for a task that is not running");
            debug_assert!(false, "double slot release for task {id}");
        }
    }

    /// Remove a task from the queue before admission. Returns false if the
    /// task is no longer queued (already admitted or never enqueued).
    pub fn remove_queued(&mut self, id: Uuid) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| *queued != id);
        self.queue.len() < before
    }

    /// Slot handles for a running task, if it is running.
    pub fn running_slot(&self, id: Uuid) -> Option<RunningSlot> {
        self.running.get(&id).cloned()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }
}
