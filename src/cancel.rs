//! Cancellation controller: the race-free inspection step.
//!
//! The decision of *how* to cancel a task is taken under the same lock
//! that serializes admission, so a task can never be dequeued and admitted
//! at the same time. The engine executes the decision afterwards: store
//! update for dequeued tasks, token trigger + wait for running ones.

use uuid::Uuid;

use crate::scheduler::{RunningSlot, SchedulerState};

/// What the controller found while holding the scheduler lock.
#[derive(Debug)]
pub enum CancelDecision {
    /// The task was still queued and has been removed; it can no longer be
    /// admitted.
    DequeuedBeforeStart,
    /// The task is running; signal it through its slot and wait for the
    /// supervisor to finalize.
    SignalRunning(RunningSlot),
    /// The scheduler does not hold the task: it is terminal, unknown, or
    /// its submission has not reached the queue yet.
    NotHeld,
}

/// Inspect and, for queued tasks, mutate scheduler state. Must be called
/// with the scheduler lock held.
pub fn decide(state: &mut SchedulerState, id: Uuid) -> CancelDecision {
    if state.remove_queued(id) {
        return CancelDecision::DequeuedBeforeStart;
    }
    if let Some(slot) = state.running_slot(id) {
        return CancelDecision::SignalRunning(slot);
    }
    CancelDecision::NotHeld
}
