//! Pure reconciliation decisions.
//!
//! Each function maps observed state onto exactly one [`ReconcileAction`]. The
//! observations are gathered by [`crate::reconcile::Reconciler`]; nothing here
//! touches a collaborator.

use crate::core::types::{ReconcileAction, Task, TaskStatus};

/// Status check: closed tasks are skipped, blocked tasks are skipped with their note.
pub fn decide_task_status(task: &Task) -> ReconcileAction {
    match task.status {
        TaskStatus::Closed => ReconcileAction::Skip {
            reason: format!("task {} is already closed", task.id),
        },
        TaskStatus::Blocked => {
            let note = task.notes.trim();
            let reason = if note.is_empty() {
                format!("task {} is blocked", task.id)
            } else {
                format!("task {} is blocked: {note}", task.id)
            };
            ReconcileAction::Skip { reason }
        }
        TaskStatus::Open | TaskStatus::InProgress => ReconcileAction::Continue,
    }
}

/// PR check: any discovered PR means the task is closed rather than resubmitted.
pub fn decide_pr(discovered_pr: Option<u64>) -> ReconcileAction {
    match discovered_pr {
        Some(pr) => ReconcileAction::Close { pr },
        None => ReconcileAction::Continue,
    }
}

/// Branch check: an existing branch is reused, never recreated.
pub fn decide_branch(existing_branch: Option<&str>) -> ReconcileAction {
    match existing_branch {
        Some(branch) => ReconcileAction::UseExisting {
            branch: branch.to_string(),
        },
        None => ReconcileAction::Continue,
    }
}

/// Observed state of a task branch relative to its parent's remote tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkObservation {
    pub branch: String,
    pub commits_ahead: u32,
    /// True when the branch's tree differs from the parent's (placeholder commits are empty).
    pub has_diff: bool,
    pub has_pr: bool,
}

/// Work check: committed, unsubmitted work goes straight to submit.
pub fn decide_work(obs: &WorkObservation) -> ReconcileAction {
    if obs.commits_ahead > 0 && obs.has_diff && !obs.has_pr {
        ReconcileAction::Submit {
            branch: obs.branch.clone(),
        }
    } else {
        ReconcileAction::Continue
    }
}

/// Uncommitted-changes check.
pub fn decide_uncommitted(dirty: bool) -> ReconcileAction {
    if dirty {
        ReconcileAction::Stash
    } else {
        ReconcileAction::Continue
    }
}

/// Stack-tool check: untracked branches are tracked before drift is considered.
pub fn decide_stack(branch: &str, tracked: bool, needs_restack: bool) -> ReconcileAction {
    if !tracked {
        return ReconcileAction::Track {
            branch: branch.to_string(),
        };
    }
    if needs_restack {
        return ReconcileAction::Restack;
    }
    ReconcileAction::Continue
}
