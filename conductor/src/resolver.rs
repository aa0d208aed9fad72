//! Task selection and epic resolution against the tracker.

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::epic;
use crate::core::selector::first_eligible;
use crate::core::types::Task;
use crate::io::tracker::Tracker;

pub struct Resolver<'a> {
    tracker: &'a dyn Tracker,
    epic_depth: usize,
}

impl<'a> Resolver<'a> {
    pub fn new(tracker: &'a dyn Tracker, epic_depth: usize) -> Self {
        Self {
            tracker,
            epic_depth,
        }
    }

    /// First eligible ready task, in tracker order.
    #[instrument(skip_all)]
    pub fn next_task(&self) -> Result<Option<Task>> {
        let ready = self.tracker.ready().context("list ready tasks")?;
        let task = first_eligible(&ready).cloned();
        debug!(ready = ready.len(), selected = ?task.as_ref().map(|t| &t.id), "task selection");
        Ok(task)
    }

    /// Nearest epic ancestor of `task`, or `None` for epic-less tasks.
    ///
    /// Lookup failures are logged and treated as unresolvable dependencies.
    pub fn resolve_epic(&self, task: &Task) -> Option<Task> {
        epic::resolve_epic(task, self.epic_depth, |id| match self.tracker.show(id) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!(id, err = %err, "dependency lookup failed");
                None
            }
        })
    }

    /// Ready tasks whose epic is `epic_id`.
    pub fn ready_children(&self, epic_id: &str) -> Result<Vec<Task>> {
        let ready = self.tracker.ready().context("list ready tasks")?;
        Ok(ready
            .into_iter()
            .filter(|t| !t.is_epic())
            .filter(|t| self.resolve_epic(t).is_some_and(|e| e.id == epic_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{FakeTracker, epic, task, task_with_deps};

    #[test]
    fn next_task_skips_epics_and_blocked_dependencies() {
        let tracker = FakeTracker::with_tasks(vec![
            epic("E1"),
            task_with_deps("T2", &["E1", "T1"]),
            task_with_deps("T1", &["E1"]),
        ]);
        let resolver = Resolver::new(&tracker, 6);
        let next = resolver.next_task().expect("next").expect("task");
        assert_eq!(next.id, "T1");
    }

    #[test]
    fn next_task_is_none_when_nothing_is_ready() {
        let mut done = task("T1");
        done.status = TaskStatus::Closed;
        let tracker = FakeTracker::with_tasks(vec![epic("E1"), done]);
        let resolver = Resolver::new(&tracker, 6);
        assert!(resolver.next_task().expect("next").is_none());
    }

    #[test]
    fn resolves_epic_through_the_tracker() {
        let tracker = FakeTracker::with_tasks(vec![
            epic("E1"),
            task_with_deps("STORY", &["E1"]),
            task_with_deps("T1", &["STORY"]),
        ]);
        let resolver = Resolver::new(&tracker, 6);
        let t1 = tracker.task("T1");
        assert_eq!(resolver.resolve_epic(&t1).map(|e| e.id), Some("E1".to_string()));
        assert!(resolver.resolve_epic(&task("LONE")).is_none());
    }

    #[test]
    fn ready_children_filters_by_epic() {
        let tracker = FakeTracker::with_tasks(vec![
            epic("E1"),
            epic("E2"),
            task_with_deps("A", &["E1"]),
            task_with_deps("B", &["E2"]),
        ]);
        let resolver = Resolver::new(&tracker, 6);
        let children: Vec<String> = resolver
            .ready_children("E1")
            .expect("children")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(children, vec!["A".to_string()]);
    }
}
