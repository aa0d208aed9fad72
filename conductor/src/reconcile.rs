//! Reconciliation against live collaborator state.
//!
//! Each check gathers observations and defers the decision to
//! [`crate::core::reconcile`]. Nothing here mutates state except
//! [`Reconciler::apply`].

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::ExternalRef;
use crate::core::reconcile::{
    WorkObservation, decide_branch, decide_pr, decide_stack, decide_task_status,
    decide_uncommitted, decide_work,
};
use crate::core::types::{ReconcileAction, Task};
use crate::io::git::Vcs;
use crate::io::graphite::StackTool;
use crate::stack::StackManager;

pub struct Reconciler<'a> {
    vcs: &'a dyn Vcs,
    stack: &'a dyn StackTool,
    branches: &'a StackManager<'a>,
}

impl<'a> Reconciler<'a> {
    pub fn new(vcs: &'a dyn Vcs, stack: &'a dyn StackTool, branches: &'a StackManager<'a>) -> Self {
        Self {
            vcs,
            stack,
            branches,
        }
    }

    pub fn task_status(&self, task: &Task) -> ReconcileAction {
        decide_task_status(task)
    }

    /// A PR from the stored reference, or from the stack log for the task branch.
    pub fn pr_reconcile(&self, task: &Task, epic: Option<&Task>) -> Result<ReconcileAction> {
        Ok(decide_pr(self.discover_pr(task, epic)?))
    }

    pub fn branch_reconcile(&self, task: &Task, epic: Option<&Task>) -> Result<ReconcileAction> {
        let existing = self.branches.find_existing_branch(task, epic)?;
        Ok(decide_branch(existing.as_deref()))
    }

    /// Committed, unsubmitted work on the checked-out `branch` relative to `parent`.
    pub fn work_reconcile(&self, branch: &str, parent: &str) -> Result<ReconcileAction> {
        let current = self.vcs.current_branch()?;
        if current != branch {
            bail!("work check expects {branch} checked out, found {current}");
        }
        let obs = WorkObservation {
            branch: branch.to_string(),
            commits_ahead: self.vcs.commits_ahead(parent)?,
            has_diff: self.vcs.has_diff(parent)?,
            has_pr: self.stack.log()?.pr_for(branch).is_some(),
        };
        debug!(?obs, "work observation");
        Ok(decide_work(&obs))
    }

    pub fn uncommitted_reconcile(&self) -> Result<ReconcileAction> {
        Ok(decide_uncommitted(self.vcs.is_dirty()?))
    }

    /// Stack-tool drift for `branch`.
    pub fn graphite_reconcile(&self, branch: &str) -> Result<ReconcileAction> {
        let log = self.stack.log().context("read stack log")?;
        let entry = log.find(branch);
        Ok(decide_stack(
            branch,
            entry.is_some(),
            entry.is_some_and(|e| e.needs_restack),
        ))
    }

    /// Status, then PR, then branch; the first non-continue result wins.
    ///
    /// Later checks are not evaluated once an earlier one decides.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn reconcile_all(&self, task: &Task, epic: Option<&Task>) -> Result<ReconcileAction> {
        let status = self.task_status(task);
        if !status.is_continue() {
            info!(action = ?status, "status check decided");
            return Ok(status);
        }
        let pr = self.pr_reconcile(task, epic)?;
        if !pr.is_continue() {
            info!(action = ?pr, "PR check decided");
            return Ok(pr);
        }
        let branch = self.branch_reconcile(task, epic)?;
        debug!(action = ?branch, "branch check");
        Ok(branch)
    }

    /// Carry out a stash/track/restack result. Other results are no-ops here.
    pub fn apply(&self, action: &ReconcileAction, parent: Option<&str>) -> Result<()> {
        match action {
            ReconcileAction::Stash => {
                let stashed = self.vcs.stash("conductor: stash before task work")?;
                info!(stashed, "stashed uncommitted changes");
            }
            ReconcileAction::Track { branch } => {
                self.stack.track(branch, parent, false)?;
                info!(branch = %branch, "tracked branch with the stack tool");
            }
            ReconcileAction::Restack => {
                self.stack.restack()?;
                info!("restacked");
            }
            _ => {}
        }
        Ok(())
    }

    /// PR number from the stored reference or the stack log.
    pub fn discover_pr(&self, task: &Task, epic: Option<&Task>) -> Result<Option<u64>> {
        let stored = task.external_ref.as_deref().map(ExternalRef::parse);
        if let Some(pr) = stored.as_ref().and_then(|r| r.pr) {
            return Ok(Some(pr));
        }
        let Some(branch) = self.branches.find_existing_branch(task, epic)? else {
            return Ok(None);
        };
        match self.stack.log() {
            Ok(log) => Ok(log.pr_for(&branch)),
            Err(err) => {
                warn!(branch = %branch, err = %err, "stack log unavailable, assuming no PR");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{FakeStack, FakeVcs, epic, task_with_deps};

    #[test]
    fn closed_task_with_branch_is_skipped() {
        let vcs = FakeVcs::new("main");
        vcs.add_branch("epic/E1/T1-foo");
        let stack = FakeStack::new(&vcs);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        let mut t1 = task_with_deps("T1", &["E1"]);
        t1.status = TaskStatus::Closed;
        let action = reconciler.reconcile_all(&t1, Some(&epic("E1"))).expect("reconcile");
        assert!(matches!(action, ReconcileAction::Skip { .. }));
    }

    #[test]
    fn existing_pr_wins_over_existing_branch() {
        let vcs = FakeVcs::new("main");
        vcs.add_branch("epic/E1/T1-foo");
        let stack = FakeStack::new(&vcs);
        stack.set_pr("epic/E1/T1-foo", 42);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        let t1 = task_with_deps("T1", &["E1"]);
        let action = reconciler.reconcile_all(&t1, Some(&epic("E1"))).expect("reconcile");
        assert_eq!(action, ReconcileAction::Close { pr: 42 });
    }

    #[test]
    fn stored_pr_reference_is_enough() {
        let vcs = FakeVcs::new("main");
        let stack = FakeStack::new(&vcs);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        let mut t1 = task_with_deps("T1", &[]);
        t1.external_ref = Some("pr:9".to_string());
        assert_eq!(
            reconciler.reconcile_all(&t1, None).expect("reconcile"),
            ReconcileAction::Close { pr: 9 }
        );
    }

    #[test]
    fn existing_branch_is_reused() {
        let vcs = FakeVcs::new("main");
        vcs.add_branch("agent/T1-foo");
        let stack = FakeStack::new(&vcs);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        assert_eq!(
            reconciler
                .reconcile_all(&task_with_deps("T1", &[]), None)
                .expect("reconcile"),
            ReconcileAction::UseExisting {
                branch: "agent/T1-foo".to_string()
            }
        );
    }

    #[test]
    fn committed_work_without_pr_goes_to_submit() {
        let vcs = FakeVcs::new("epic/E1/T1-foo");
        vcs.set_work("epic/E1/T1-foo", 1, true);
        let stack = FakeStack::new(&vcs);
        stack.track_branch("epic/E1/T1-foo");
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        assert_eq!(
            reconciler.work_reconcile("epic/E1/T1-foo", "main").expect("work"),
            ReconcileAction::Submit {
                branch: "epic/E1/T1-foo".to_string()
            }
        );

        vcs.set_work("epic/E1/T1-foo", 1, false);
        assert_eq!(
            reconciler.work_reconcile("epic/E1/T1-foo", "main").expect("work"),
            ReconcileAction::Continue
        );
    }

    #[test]
    fn graphite_check_tracks_then_restacks() {
        let vcs = FakeVcs::new("agent/T1-foo");
        let stack = FakeStack::new(&vcs);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        let action = reconciler.graphite_reconcile("agent/T1-foo").expect("check");
        assert_eq!(
            action,
            ReconcileAction::Track {
                branch: "agent/T1-foo".to_string()
            }
        );
        reconciler.apply(&action, Some("main")).expect("apply");

        stack.mark_needs_restack("agent/T1-foo");
        let action = reconciler.graphite_reconcile("agent/T1-foo").expect("check");
        assert_eq!(action, ReconcileAction::Restack);
        reconciler.apply(&action, None).expect("apply");
        assert_eq!(
            stack.calls(),
            vec!["track agent/T1-foo".to_string(), "restack".to_string()]
        );
    }

    #[test]
    fn dirty_tree_is_stashed() {
        let vcs = FakeVcs::new("main");
        vcs.set_worktree_diff("+wip");
        let stack = FakeStack::new(&vcs);
        let manager = StackManager::new(&vcs, &stack, "main");
        let reconciler = Reconciler::new(&vcs, &stack, &manager);

        let action = reconciler.uncommitted_reconcile().expect("check");
        assert_eq!(action, ReconcileAction::Stash);
        reconciler.apply(&action, None).expect("apply");
        assert_eq!(vcs.stashes(), 1);
        assert_eq!(
            reconciler.uncommitted_reconcile().expect("check"),
            ReconcileAction::Continue
        );
    }
}
