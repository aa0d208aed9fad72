//! Test-only builders and in-memory fakes for the collaborator traits.
//!
//! The fakes share state through `Rc<RefCell<..>>` so a stack fake and a model
//! fake can act on the same simulated working tree.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::types::{Comment, Task, TaskStatus, TaskUpdate, ValidationReport};
use crate::io::config::LoopConfig;
use crate::io::git::{BranchRef, Vcs};
use crate::io::graphite::{StackEntry, StackLog, StackTool, SubmitResult};
use crate::io::model::{ModelInvoker, ModelMap, ModelResponse};
use crate::io::sleeper::Sleeper;
use crate::io::tracker::Tracker;
use crate::io::validation::Validator;
use crate::pipeline::{Collaborators, IterationOutcome, Orchestrator};

pub use crate::io::state_store::MemoryStateStore;

/// Open, non-epic task with deterministic fields.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        status: TaskStatus::Open,
        issue_type: "task".to_string(),
        description: format!("{id} description"),
        dependencies: Vec::new(),
        external_ref: None,
        notes: String::new(),
    }
}

pub fn epic(id: &str) -> Task {
    Task {
        issue_type: "epic".to_string(),
        ..task(id)
    }
}

pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
        ..task(id)
    }
}

pub fn reply(output: &str) -> ModelResponse {
    ModelResponse {
        output: output.to_string(),
        exit_code: 0,
    }
}

pub fn fail(exit_code: i32, output: &str) -> ModelResponse {
    ModelResponse {
        output: output.to_string(),
        exit_code,
    }
}

/// Config with one distinct model id per role and no waiting between retries.
pub fn test_config() -> LoopConfig {
    LoopConfig {
        models: ModelMap {
            implementer: "implementer".to_string(),
            reviewer: "reviewer".to_string(),
            checker: "checker".to_string(),
            classifier: "classifier".to_string(),
        },
        model_max_retries: 0,
        ..LoopConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Version control

#[derive(Debug, Clone, Default)]
struct FakeBranch {
    local: bool,
    remote: bool,
    commit_time: i64,
    commits_ahead: u32,
    has_diff: bool,
}

#[derive(Debug, Default)]
struct VcsState {
    current: String,
    branches: BTreeMap<String, FakeBranch>,
    worktree: String,
    staged: String,
    stashes: Vec<String>,
    commits: Vec<String>,
    busy_elsewhere: BTreeSet<String>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
    clock: i64,
}

impl VcsState {
    fn take_failure(&mut self, op: &str) -> Result<()> {
        match self.failures.remove(op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

/// Simulated git working tree.
#[derive(Debug, Clone)]
pub struct FakeVcs {
    state: Rc<RefCell<VcsState>>,
}

impl FakeVcs {
    /// A repo with `branch` checked out and existing locally and on the remote.
    pub fn new(branch: &str) -> Self {
        let vcs = Self {
            state: Rc::new(RefCell::new(VcsState::default())),
        };
        vcs.add_branch(branch);
        vcs.add_remote_branch(branch);
        vcs.state.borrow_mut().current = branch.to_string();
        vcs
    }

    pub fn add_branch(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        let time = state.tick();
        let entry = state.branches.entry(name.to_string()).or_default();
        entry.local = true;
        entry.commit_time = time;
    }

    pub fn add_remote_branch(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        let time = state.tick();
        let entry = state.branches.entry(name.to_string()).or_default();
        entry.remote = true;
        entry.commit_time = entry.commit_time.max(time);
    }

    pub fn remove_remote_branch(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.branches.get_mut(name) {
            entry.remote = false;
        }
    }

    /// Set committed work on a branch relative to its parent.
    pub fn set_work(&self, name: &str, commits_ahead: u32, has_diff: bool) {
        let mut state = self.state.borrow_mut();
        let entry = state.branches.entry(name.to_string()).or_default();
        entry.commits_ahead = commits_ahead;
        entry.has_diff = has_diff;
    }

    pub fn set_worktree_diff(&self, diff: &str) {
        self.state.borrow_mut().worktree = diff.to_string();
    }

    pub fn append_worktree(&self, diff: &str) {
        let mut state = self.state.borrow_mut();
        if !state.worktree.is_empty() {
            state.worktree.push('\n');
        }
        state.worktree.push_str(diff);
    }

    /// Make checkouts of `name` fail as if it were checked out in another worktree.
    pub fn busy_elsewhere(&self, name: &str) {
        self.state
            .borrow_mut()
            .busy_elsewhere
            .insert(name.to_string());
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: &str, message: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn current(&self) -> String {
        self.state.borrow().current.clone()
    }

    pub fn staged(&self) -> String {
        self.state.borrow().staged.clone()
    }

    pub fn stashes(&self) -> usize {
        self.state.borrow().stashes.len()
    }

    pub fn commits(&self) -> Vec<String> {
        self.state.borrow().commits.clone()
    }

    pub fn local_branches(&self) -> Vec<String> {
        self.state
            .borrow()
            .branches
            .iter()
            .filter(|(_, b)| b.local)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Mutating calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }

    /// Create `name` at the current tip and check it out.
    fn create_branch(&self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.branches.get(name).is_some_and(|b| b.local) {
            bail!("fatal: a branch named '{name}' already exists");
        }
        let time = state.tick();
        state.branches.insert(
            name.to_string(),
            FakeBranch {
                local: true,
                commit_time: time,
                ..FakeBranch::default()
            },
        );
        state.current = name.to_string();
        Ok(())
    }

    /// Commit everything staged or unstaged onto the current branch.
    fn commit_all(&self, message: &str) {
        let mut state = self.state.borrow_mut();
        let worktree = std::mem::take(&mut state.worktree);
        let staged = std::mem::take(&mut state.staged);
        let changed = !worktree.trim().is_empty() || !staged.trim().is_empty();
        let time = state.tick();
        let current = state.current.clone();
        let branch = state.branches.entry(current).or_default();
        branch.commits_ahead += 1;
        branch.has_diff |= changed;
        branch.commit_time = time;
        state.commits.push(message.to_string());
    }

    fn publish_current(&self) {
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        state.branches.entry(current).or_default().remote = true;
    }
}

impl Vcs for FakeVcs {
    fn current_branch(&self) -> Result<String> {
        Ok(self.current())
    }

    fn is_dirty(&self) -> Result<bool> {
        let state = self.state.borrow();
        Ok(!state.worktree.is_empty() || !state.staged.is_empty())
    }

    fn list_branches(&self, prefix: &str) -> Result<Vec<BranchRef>> {
        let mut state = self.state.borrow_mut();
        state.take_failure("list_branches")?;
        let mut refs: Vec<BranchRef> = state
            .branches
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, b)| BranchRef {
                name: name.clone(),
                local: b.local,
                remote: b.remote,
                commit_time: b.commit_time,
            })
            .collect();
        refs.sort_by(|a, b| b.commit_time.cmp(&a.commit_time).then(a.name.cmp(&b.name)));
        Ok(refs)
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.state.borrow().branches.get(branch).is_some_and(|b| b.local))
    }

    fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.state.borrow().branches.get(branch).is_some_and(|b| b.remote))
    }

    fn stash(&self, message: &str) -> Result<bool> {
        self.record("stash".to_string());
        let mut state = self.state.borrow_mut();
        state.take_failure("stash")?;
        if state.worktree.is_empty() && state.staged.is_empty() {
            return Ok(false);
        }
        state.worktree.clear();
        state.staged.clear();
        state.stashes.push(message.to_string());
        Ok(true)
    }

    fn fetch(&self, branch: Option<&str>) -> Result<()> {
        self.record(match branch {
            Some(branch) => format!("fetch {branch}"),
            None => "fetch".to_string(),
        });
        self.state.borrow_mut().take_failure("fetch")
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.record(format!("checkout {branch}"));
        let mut state = self.state.borrow_mut();
        state.take_failure("checkout")?;
        if state.busy_elsewhere.contains(branch) {
            bail!("fatal: '{branch}' is already used by worktree at '/tmp/other'");
        }
        let Some(entry) = state.branches.get_mut(branch) else {
            bail!("error: pathspec '{branch}' did not match any file(s) known to git");
        };
        entry.local = true;
        state.current = branch.to_string();
        Ok(())
    }

    fn checkout_tracking(&self, local: &str, upstream: &str) -> Result<()> {
        self.record(format!("checkout_tracking {local} {upstream}"));
        let mut state = self.state.borrow_mut();
        state.take_failure("checkout_tracking")?;
        if !state.branches.get(upstream).is_some_and(|b| b.remote) {
            bail!("fatal: 'origin/{upstream}' is not a commit");
        }
        let time = state.tick();
        state.branches.insert(
            local.to_string(),
            FakeBranch {
                local: true,
                commit_time: time,
                ..FakeBranch::default()
            },
        );
        state.current = local.to_string();
        Ok(())
    }

    fn pull_rebase(&self, branch: &str) -> Result<()> {
        self.record(format!("pull_rebase {branch}"));
        self.state.borrow_mut().take_failure("pull_rebase")
    }

    fn abort_rebase(&self) -> Result<()> {
        self.record("abort_rebase".to_string());
        self.state.borrow_mut().take_failure("abort_rebase")
    }

    fn commits_ahead(&self, _base: &str) -> Result<u32> {
        let state = self.state.borrow();
        Ok(state
            .branches
            .get(&state.current)
            .map_or(0, |b| b.commits_ahead))
    }

    fn has_diff(&self, _base: &str) -> Result<bool> {
        let state = self.state.borrow();
        Ok(state.branches.get(&state.current).is_some_and(|b| b.has_diff))
    }

    fn add_all(&self) -> Result<()> {
        self.record("add_all".to_string());
        let mut state = self.state.borrow_mut();
        state.take_failure("add_all")?;
        let worktree = std::mem::take(&mut state.worktree);
        if !worktree.is_empty() {
            if !state.staged.is_empty() {
                state.staged.push('\n');
            }
            state.staged.push_str(&worktree);
        }
        Ok(())
    }

    fn staged_diff(&self) -> Result<String> {
        Ok(self.staged())
    }

    fn commit_empty(&self, message: &str) -> Result<()> {
        self.record("commit_empty".to_string());
        let mut state = self.state.borrow_mut();
        state.take_failure("commit_empty")?;
        let time = state.tick();
        let current = state.current.clone();
        let branch = state.branches.entry(current).or_default();
        branch.commits_ahead += 1;
        branch.commit_time = time;
        state.commits.push(message.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stack tool

#[derive(Debug, Default)]
struct StackState {
    tracked: BTreeMap<String, Option<String>>,
    prs: BTreeMap<String, u64>,
    needs_restack: BTreeSet<String>,
    next_pr: u64,
    failures: HashMap<String, String>,
    calls: Vec<String>,
}

/// Simulated stack tool operating on a [`FakeVcs`].
#[derive(Debug, Clone)]
pub struct FakeStack {
    vcs: FakeVcs,
    state: Rc<RefCell<StackState>>,
}

impl FakeStack {
    pub fn new(vcs: &FakeVcs) -> Self {
        Self {
            vcs: vcs.clone(),
            state: Rc::new(RefCell::new(StackState {
                next_pr: 100,
                ..StackState::default()
            })),
        }
    }

    pub fn track_branch(&self, branch: &str) {
        self.state
            .borrow_mut()
            .tracked
            .insert(branch.to_string(), None);
    }

    /// Record an already-open PR for `branch` (tracks it too).
    pub fn set_pr(&self, branch: &str, pr: u64) {
        let mut state = self.state.borrow_mut();
        state.tracked.entry(branch.to_string()).or_insert(None);
        state.prs.insert(branch.to_string(), pr);
    }

    pub fn mark_needs_restack(&self, branch: &str) {
        self.state
            .borrow_mut()
            .needs_restack
            .insert(branch.to_string());
    }

    pub fn fail_next(&self, op: &str, message: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn parent_of(&self, branch: &str) -> Option<String> {
        self.state.borrow().tracked.get(branch).cloned().flatten()
    }

    fn begin(&self, call: String, op: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        match state.failures.remove(op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

impl StackTool for FakeStack {
    fn create(&self, branch: &str, parent: &str, message: &str) -> Result<()> {
        self.begin(format!("create {branch} {parent}"), "create")?;
        self.vcs.create_branch(branch)?;
        if !self.vcs.staged().is_empty() {
            self.vcs.commit_all(message);
        }
        self.state
            .borrow_mut()
            .tracked
            .insert(branch.to_string(), Some(parent.to_string()));
        Ok(())
    }

    fn modify(&self, message: &str) -> Result<()> {
        self.begin("modify".to_string(), "modify")?;
        self.vcs.commit_all(message);
        Ok(())
    }

    fn submit(&self) -> Result<SubmitResult> {
        self.begin("submit".to_string(), "submit")?;
        let branch = self.vcs.current();
        let mut state = self.state.borrow_mut();
        let pr = match state.prs.get(&branch) {
            Some(pr) => *pr,
            None => {
                let pr = state.next_pr;
                state.next_pr += 1;
                state.prs.insert(branch.clone(), pr);
                pr
            }
        };
        state.tracked.entry(branch).or_insert(None);
        drop(state);
        self.vcs.publish_current();
        Ok(SubmitResult {
            pr_number: Some(pr),
            output: format!("created https://github.com/acme/repo/pull/{pr}"),
        })
    }

    fn track(&self, branch: &str, parent: Option<&str>, force: bool) -> Result<()> {
        let call = if force {
            format!("track --force {branch}")
        } else {
            format!("track {branch}")
        };
        self.begin(call, "track")?;
        self.state
            .borrow_mut()
            .tracked
            .insert(branch.to_string(), parent.map(str::to_string));
        Ok(())
    }

    fn restack(&self) -> Result<()> {
        self.begin("restack".to_string(), "restack")?;
        self.state.borrow_mut().needs_restack.clear();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.begin("sync".to_string(), "sync")
    }

    fn log(&self) -> Result<StackLog> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = state.failures.remove("log") {
            return Err(anyhow!(message));
        }
        let entries = state
            .tracked
            .keys()
            .map(|branch| StackEntry {
                branch: branch.clone(),
                pr: state.prs.get(branch).copied(),
                needs_restack: state.needs_restack.contains(branch),
            })
            .collect();
        Ok(StackLog { entries })
    }
}

// ---------------------------------------------------------------------------
// Tracker

#[derive(Debug, Default)]
struct TrackerState {
    tasks: Vec<Task>,
    comments: BTreeMap<String, Vec<Comment>>,
    updates: Vec<(String, TaskUpdate)>,
    closes: Vec<(String, String)>,
    failures: HashMap<String, String>,
}

impl TrackerState {
    fn take_failure(&mut self, op: &str) -> Result<()> {
        match self.failures.remove(op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("issue {id} not found"))
    }
}

/// In-memory issue tracker. `ready` keeps insertion order.
#[derive(Debug, Default)]
pub struct FakeTracker {
    state: RefCell<TrackerState>,
}

impl FakeTracker {
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            state: RefCell::new(TrackerState {
                tasks,
                ..TrackerState::default()
            }),
        }
    }

    pub fn task(&self, id: &str) -> Task {
        self.state
            .borrow()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("no task {id}"))
    }

    pub fn add_answer(&self, id: &str, author: &str, text: &str) {
        self.state
            .borrow_mut()
            .comments
            .entry(id.to_string())
            .or_default()
            .push(Comment {
                author: author.to_string(),
                text: text.to_string(),
            });
    }

    pub fn fail_next(&self, op: &str, message: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn updates(&self) -> Vec<(String, TaskUpdate)> {
        self.state.borrow().updates.clone()
    }

    pub fn closes(&self) -> Vec<(String, String)> {
        self.state.borrow().closes.clone()
    }

    pub fn comments_on(&self, id: &str) -> Vec<Comment> {
        self.state
            .borrow()
            .comments
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Tracker for FakeTracker {
    fn ready(&self) -> Result<Vec<Task>> {
        let mut state = self.state.borrow_mut();
        state.take_failure("ready")?;
        let satisfied = |dep: &str| {
            state
                .tasks
                .iter()
                .find(|t| t.id == dep)
                .is_none_or(|t| t.is_epic() || t.status == TaskStatus::Closed)
        };
        Ok(state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Open | TaskStatus::InProgress))
            .filter(|t| t.dependencies.iter().all(|d| satisfied(d)))
            .cloned()
            .collect())
    }

    fn show(&self, id: &str) -> Result<Task> {
        let mut state = self.state.borrow_mut();
        state.take_failure("show")?;
        state.get_mut(id).map(|t| t.clone())
    }

    fn update(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.take_failure("update")?;
        let task = state.get_mut(id)?;
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(notes) = &update.notes {
            task.notes = notes.clone();
        }
        if let Some(external_ref) = &update.external_ref {
            task.external_ref = Some(external_ref.clone());
        }
        state.updates.push((id.to_string(), update.clone()));
        Ok(())
    }

    fn close(&self, id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.take_failure("close")?;
        state.get_mut(id)?.status = TaskStatus::Closed;
        state.closes.push((id.to_string(), reason.to_string()));
        Ok(())
    }

    fn add_comment(&self, id: &str, text: &str) -> Result<()> {
        self.add_answer(id, "conductor", text);
        Ok(())
    }

    fn comments(&self, id: &str) -> Result<Vec<Comment>> {
        Ok(self.comments_on(id))
    }
}

// ---------------------------------------------------------------------------
// Models, validation, sleeping

#[derive(Debug, Default)]
struct ModelState {
    scripts: HashMap<String, VecDeque<ModelResponse>>,
    edits: HashMap<String, String>,
    prompts: Vec<(String, String)>,
}

/// Replays scripted responses per model id. The last response repeats.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    state: RefCell<ModelState>,
    vcs: RefCell<Option<FakeVcs>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, model: &str, responses: Vec<ModelResponse>) -> Self {
        self.state
            .borrow_mut()
            .scripts
            .insert(model.to_string(), responses.into());
        self
    }

    /// Every successful call of `model` appends `diff` to the attached working tree.
    pub fn with_edit(self, model: &str, diff: &str) -> Self {
        self.state
            .borrow_mut()
            .edits
            .insert(model.to_string(), diff.to_string());
        self
    }

    pub fn attach_vcs(&self, vcs: &FakeVcs) {
        *self.vcs.borrow_mut() = Some(vcs.clone());
    }

    pub fn calls(&self, model: &str) -> usize {
        self.state
            .borrow()
            .prompts
            .iter()
            .filter(|(m, _)| m == model)
            .count()
    }

    pub fn last_prompt(&self, model: &str) -> Option<String> {
        self.state
            .borrow()
            .prompts
            .iter()
            .rev()
            .find(|(m, _)| m == model)
            .map(|(_, p)| p.clone())
    }
}

impl ModelInvoker for ScriptedModel {
    fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse> {
        let mut state = self.state.borrow_mut();
        state
            .prompts
            .push((model_id.to_string(), prompt.to_string()));
        let queue = state
            .scripts
            .get_mut(model_id)
            .ok_or_else(|| anyhow!("no script for model {model_id}"))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .ok_or_else(|| anyhow!("script for model {model_id} is empty"))?;
        if response.success()
            && let Some(diff) = state.edits.get(model_id)
            && let Some(vcs) = self.vcs.borrow().as_ref()
        {
            vcs.append_worktree(diff);
        }
        Ok(response)
    }
}

/// Replays validation results; the last one repeats.
#[derive(Debug, Default)]
pub struct FakeValidator {
    reports: RefCell<VecDeque<bool>>,
    validations: Cell<u32>,
    reinstalls: Cell<u32>,
}

impl FakeValidator {
    pub fn passing() -> Self {
        Self::script(vec![true])
    }

    pub fn failing() -> Self {
        Self::script(vec![false])
    }

    pub fn script(results: Vec<bool>) -> Self {
        Self {
            reports: RefCell::new(results.into()),
            ..Self::default()
        }
    }

    pub fn validations(&self) -> u32 {
        self.validations.get()
    }

    pub fn reinstalls(&self) -> u32 {
        self.reinstalls.get()
    }
}

impl Validator for FakeValidator {
    fn validate(&self) -> Result<ValidationReport> {
        self.validations.set(self.validations.get() + 1);
        let mut reports = self.reports.borrow_mut();
        let passed = if reports.len() > 1 {
            reports.pop_front()
        } else {
            reports.front().copied()
        }
        .unwrap_or(true);
        Ok(ValidationReport {
            passed,
            exit_code: Some(if passed { 0 } else { 1 }),
            tail: if passed {
                "ok".to_string()
            } else {
                "test suite failed: 2 failing".to_string()
            },
        })
    }

    fn reinstall(&self) -> Result<ValidationReport> {
        self.reinstalls.set(self.reinstalls.get() + 1);
        Ok(ValidationReport {
            passed: true,
            exit_code: Some(0),
            tail: String::new(),
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

// ---------------------------------------------------------------------------
// Whole-pipeline fixture

/// Implementer reply that reports completion.
pub const DONE: &str = r#"{"status":"done","summary":"implemented"}"#;
pub const APPROVE: &str = r#"{"approved":true,"comments":[]}"#;
pub const COMPLETE: &str = r#"{"complete":true,"confidence":0.9}"#;

/// Models that implement, approve, and pass the check on the first try.
pub fn happy_models() -> ScriptedModel {
    ScriptedModel::new()
        .script("implementer", vec![reply(DONE)])
        .with_edit("implementer", "+fn feature() {}")
        .script("reviewer", vec![reply(APPROVE)])
        .script("checker", vec![reply(COMPLETE)])
}

/// Every collaborator fake plus a config, ready to build an [`Orchestrator`].
pub struct Fixture {
    pub vcs: FakeVcs,
    pub stack: FakeStack,
    pub tracker: FakeTracker,
    pub model: ScriptedModel,
    pub validator: FakeValidator,
    pub store: MemoryStateStore,
    pub sleeper: RecordingSleeper,
    pub config: LoopConfig,
}

impl Fixture {
    /// Repository on `main` with `tasks` in the tracker and [`happy_models`].
    pub fn new(tasks: Vec<Task>) -> Self {
        let vcs = FakeVcs::new("main");
        let stack = FakeStack::new(&vcs);
        Self {
            stack,
            tracker: FakeTracker::with_tasks(tasks),
            model: Self::attached(happy_models(), &vcs),
            validator: FakeValidator::passing(),
            store: MemoryStateStore::default(),
            sleeper: RecordingSleeper::default(),
            config: test_config(),
            vcs,
        }
    }

    pub fn with_models(mut self, model: ScriptedModel) -> Self {
        self.model = Self::attached(model, &self.vcs);
        self
    }

    pub fn with_validator(mut self, validator: FakeValidator) -> Self {
        self.validator = validator;
        self
    }

    fn attached(model: ScriptedModel, vcs: &FakeVcs) -> ScriptedModel {
        model.attach_vcs(vcs);
        model
    }

    pub fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            Collaborators {
                vcs: &self.vcs,
                stack: &self.stack,
                tracker: &self.tracker,
                model: &self.model,
                validator: &self.validator,
                store: &self.store,
                sleeper: &self.sleeper,
            },
            &self.config,
        )
    }

    pub fn run_once(&self) -> IterationOutcome {
        self.orchestrator().run_once().expect("iteration")
    }
}
