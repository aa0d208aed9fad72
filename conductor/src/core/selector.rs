//! Deterministic task selection from the tracker's ready list.

use crate::core::types::{Task, TaskStatus};

/// Return the first eligible task in tracker order.
///
/// Epics are aggregation roots and never worked on directly; closed or blocked
/// entries are ignored even if the tracker reports them.
pub fn first_eligible(ready: &[Task]) -> Option<&Task> {
    ready
        .iter()
        .find(|task| !task.is_epic() && !is_terminal(task.status))
}

/// Returns true if the task is stuck: its persisted failure count exceeds the ceiling.
pub fn is_stuck(failures: u32, max_failures: u32) -> bool {
    failures > max_failures
}

fn is_terminal(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Closed | TaskStatus::Blocked)
}
