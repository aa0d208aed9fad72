//! Epic resolution over the task dependency graph.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::core::types::Task;

/// Default maximum number of dependency hops searched for an epic.
pub const DEFAULT_EPIC_DEPTH: usize = 6;

/// Breadth-first search for the nearest epic-typed ancestor of `task`.
///
/// `lookup` resolves a task id to its detail; ids it cannot resolve are skipped.
/// Cycles are broken by a visited set and the search never goes deeper than
/// `max_depth` hops. Returns `None` when the task is epic-less.
pub fn resolve_epic<F>(task: &Task, max_depth: usize, mut lookup: F) -> Option<Task>
where
    F: FnMut(&str) -> Option<Task>,
{
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(task.id.clone());

    let mut queue: VecDeque<(String, usize)> = task
        .dependencies
        .iter()
        .map(|dep| (dep.clone(), 1))
        .collect();

    while let Some((id, depth)) = queue.pop_front() {
        if depth > max_depth || !visited.insert(id.clone()) {
            continue;
        }
        let Some(node) = lookup(&id) else {
            debug!(id = %id, "dependency not resolvable, skipping");
            continue;
        };
        if node.is_epic() {
            debug!(task = %task.id, epic = %node.id, depth, "epic resolved");
            return Some(node);
        }
        for dep in &node.dependencies {
            if !visited.contains(dep) {
                queue.push_back((dep.clone(), depth + 1));
            }
        }
    }
    None
}
