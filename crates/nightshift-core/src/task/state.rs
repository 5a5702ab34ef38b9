//! Task state machine.
//!
//! Enforces the legal transition graph for task statuses. The execution
//! driver in [`super`] only ever requests transitions along these edges;
//! `reset` is a separate operation, not a transition.

use nightshift_types::TaskStatus;

/// The task state machine.
///
/// Valid transition graph:
///
/// ```text
/// pending -> running
/// pending -> skipped    (externally set)
/// running -> completed
/// running -> failed
/// running -> cancelled
/// running -> pending    (retry after backoff)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Pending)
        )
    }
}
