//! Task branch preparation on top of the stack tool.
//!
//! Branch existence is the "work already started" signal: an existing task
//! branch is always reused, and a new one is created (with a placeholder
//! commit) before any agent runs.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::{ExternalRef, branch_belongs_to_task, branch_name, branch_namespace};
use crate::core::types::Task;
use crate::io::git::Vcs;
use crate::io::graphite::StackTool;

/// Prefix of local branches that stand in for a parent checked out elsewhere.
pub const TRACKING_PREFIX: &str = "track/";

/// Outcome of [`StackManager::prepare_branch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResult {
    pub success: bool,
    pub branch: Option<String>,
    /// Branch the task branch is stacked on.
    pub parent: Option<String>,
    /// False when an existing branch was reused.
    pub created: bool,
    pub error: Option<String>,
}

impl PrepareResult {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            branch: None,
            parent: None,
            created: false,
            error: Some(error),
        }
    }
}

pub struct StackManager<'a> {
    vcs: &'a dyn Vcs,
    stack: &'a dyn StackTool,
    base_branch: &'a str,
}

impl<'a> StackManager<'a> {
    pub fn new(vcs: &'a dyn Vcs, stack: &'a dyn StackTool, base_branch: &'a str) -> Self {
        Self {
            vcs,
            stack,
            base_branch,
        }
    }

    /// Existing branch for `task`: the stored reference if it still exists,
    /// else the newest local or remote branch under the task's namespace.
    pub fn find_existing_branch(&self, task: &Task, epic: Option<&Task>) -> Result<Option<String>> {
        let epic_id = epic.map(|e| e.id.as_str());
        let stored = task
            .external_ref
            .as_deref()
            .map(ExternalRef::parse)
            .and_then(|r| r.branch);
        if let Some(branch) = stored
            && branch_belongs_to_task(&branch, epic_id, &task.id)
            && (self.vcs.branch_exists(&branch)? || self.vcs.remote_branch_exists(&branch)?)
        {
            return Ok(Some(branch));
        }
        let found = self
            .vcs
            .list_branches(&branch_namespace(epic_id))?
            .into_iter()
            .find(|b| branch_belongs_to_task(&b.name, epic_id, &task.id))
            .map(|b| b.name);
        Ok(found)
    }

    /// Parent for a new task branch: a dependency's branch in the same epic,
    /// then the epic tip, then the base branch.
    pub fn choose_parent(&self, task: &Task, epic: Option<&Task>) -> Result<String> {
        let Some(epic) = epic else {
            return Ok(self.base_branch.to_string());
        };
        let namespace = branch_namespace(Some(&epic.id));
        let branches = self.vcs.list_branches(&namespace)?;

        for dep in task.dependencies.iter().filter(|d| **d != epic.id) {
            if let Some(branch) = branches
                .iter()
                .find(|b| branch_belongs_to_task(&b.name, Some(&epic.id), dep))
            {
                debug!(dependency = %dep, parent = %branch.name, "parent from dependency");
                return Ok(branch.name.clone());
            }
        }
        if let Some(tip) = branches
            .iter()
            .find(|b| !branch_belongs_to_task(&b.name, Some(&epic.id), &task.id))
        {
            debug!(parent = %tip.name, "parent from epic tip");
            return Ok(tip.name.clone());
        }
        Ok(self.base_branch.to_string())
    }

    /// Reuse or create the task branch and leave it checked out.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn prepare_branch(&self, task: &Task, epic: Option<&Task>, title: &str) -> PrepareResult {
        match self.try_prepare(task, epic, title) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "branch preparation failed");
                PrepareResult::failed(format!("{err:#}"))
            }
        }
    }

    fn try_prepare(&self, task: &Task, epic: Option<&Task>, title: &str) -> Result<PrepareResult> {
        if let Some(branch) = self.find_existing_branch(task, epic)? {
            let parent = match task
                .external_ref
                .as_deref()
                .map(ExternalRef::parse)
                .and_then(|r| r.parent)
            {
                Some(parent) => parent,
                None => self.choose_parent(task, epic)?,
            };
            if self.vcs.current_branch().ok().as_deref() != Some(branch.as_str()) {
                self.vcs
                    .checkout(&branch)
                    .with_context(|| format!("checkout existing branch {branch}"))?;
            }
            self.vcs
                .pull_rebase(&branch)
                .with_context(|| format!("rebase-pull {branch}"))?;
            info!(branch = %branch, parent = %parent, "reusing existing task branch");
            return Ok(PrepareResult {
                success: true,
                branch: Some(branch),
                parent: Some(parent),
                created: false,
                error: None,
            });
        }

        let epic_id = epic.map(|e| e.id.as_str());
        let branch = branch_name(epic_id, &task.id, title);
        let parent = self.choose_parent(task, epic)?;
        let parent = self.checkout_parent(&parent)?;
        self.stack
            .create(&branch, &parent, &format!("{}: {title}", task.id))
            .with_context(|| format!("create branch {branch} on {parent}"))?;
        self.vcs
            .commit_empty(&format!("chore({}): start {title}", task.id))
            .with_context(|| format!("placeholder commit on {branch}"))?;
        info!(branch = %branch, parent = %parent, "created task branch");
        Ok(PrepareResult {
            success: true,
            branch: Some(branch),
            parent: Some(parent),
            created: true,
            error: None,
        })
    }

    /// Check out `parent`, falling back to a local tracking branch at its
    /// remote tip. Returns the branch actually checked out.
    fn checkout_parent(&self, parent: &str) -> Result<String> {
        match self.vcs.checkout(parent) {
            Ok(()) => {
                if parent == self.base_branch
                    && let Err(err) = self.vcs.pull_rebase(parent)
                {
                    warn!(err = %err, "could not refresh base branch, continuing from local tip");
                }
                Ok(parent.to_string())
            }
            Err(err) => {
                let tracking = format!("{TRACKING_PREFIX}{parent}");
                warn!(parent, tracking = %tracking, err = %err, "parent unavailable here, using tracking branch");
                self.vcs
                    .fetch(Some(parent))
                    .with_context(|| format!("fetch {parent}"))?;
                self.vcs
                    .checkout_tracking(&tracking, parent)
                    .with_context(|| format!("checkout tracking branch for {parent}"))?;
                self.stack
                    .track(&tracking, Some(self.base_branch), true)
                    .with_context(|| format!("track {tracking}"))?;
                Ok(tracking)
            }
        }
    }
}
