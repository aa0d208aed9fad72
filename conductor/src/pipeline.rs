//! One task lifecycle per iteration.
//!
//! PICK_TASK → PREPARE_BRANCH → VALIDATE_PRE → IMPLEMENT → VALIDATE_POST →
//! REVIEW → CHECK → (REPAIR, bounded) → SUBMIT → CLOSE. Every step failure is
//! classified, allowlisted remediation runs, and the task is retried, released,
//! or blocked with a reason written to the tracker. Collaborator errors outside
//! a classified step still count against the task and block it with a note.

use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::agents::checker::CheckerAgent;
use crate::agents::classifier::ModelClassifier;
use crate::agents::harness::Harness;
use crate::agents::implementer::ImplementerAgent;
use crate::agents::repair::RepairAgent;
use crate::agents::reviewer::ReviewerAgent;
use crate::core::naming::{ExternalRef, branch_namespace};
use crate::core::phase::Phase;
use crate::core::remediation::RemediationAction;
use crate::core::selector::is_stuck;
use crate::core::types::{
    AgentOutcome, CheckVerdict, Classification, ReconcileAction, Task, TaskStatus, TaskUpdate,
};
use crate::health::{HealthMonitor, PreflightOutcome};
use crate::io::background::{BackgroundProcess, DEFAULT_GRACE};
use crate::io::config::LoopConfig;
use crate::io::git::Vcs;
use crate::io::graphite::StackTool;
use crate::io::model::ModelInvoker;
use crate::io::process::tail_lines;
use crate::io::sleeper::Sleeper;
use crate::io::state_store::{OrchestratorState, StateStore};
use crate::io::tracker::Tracker;
use crate::io::validation::Validator;
use crate::reconcile::Reconciler;
use crate::remediation::{
    ActionResult, ClassifierChain, ExecutionContext, FailureContext, HeuristicClassifier,
    RemediationExecutor,
};
use crate::resolver::Resolver;
use crate::stack::StackManager;

const REASON_TAIL_LINES: usize = 20;

/// Everything the state machine talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub vcs: &'a dyn Vcs,
    pub stack: &'a dyn StackTool,
    pub tracker: &'a dyn Tracker,
    pub model: &'a dyn ModelInvoker,
    pub validator: &'a dyn Validator,
    pub store: &'a dyn StateStore,
    pub sleeper: &'a dyn Sleeper,
}

/// How an iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// No eligible task.
    Idle,
    Closed { task_id: String, pr: u64 },
    Blocked { task_id: String, reason: String },
    Skipped { task_id: String, reason: String },
    /// Retries exhausted on a transient failure; the task goes back to open.
    Released { task_id: String, reason: String },
    /// Baseline validation is broken. `paused` means the breaker is open.
    InfraFailure { task_id: String, paused: bool },
}

impl fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Closed { task_id, pr } => write!(f, "{task_id} closed with PR #{pr}"),
            Self::Blocked { task_id, .. } => write!(f, "{task_id} blocked"),
            Self::Skipped { task_id, .. } => write!(f, "{task_id} skipped"),
            Self::Released { task_id, .. } => write!(f, "{task_id} released"),
            Self::InfraFailure { task_id, paused } => {
                write!(f, "{task_id} released on infra failure (paused: {paused})")
            }
        }
    }
}

pub struct Orchestrator<'a> {
    deps: Collaborators<'a>,
    config: &'a LoopConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(deps: Collaborators<'a>, config: &'a LoopConfig) -> Self {
        Self { deps, config }
    }

    /// Run one task through the pipeline, or report idle.
    #[instrument(skip_all)]
    pub fn run_once(&self) -> Result<IterationOutcome> {
        let config = self.config;
        let mut state = self.deps.store.load().context("load orchestrator state")?;
        let resolver = Resolver::new(self.deps.tracker, config.epic_depth);
        let Some(task) = self.pick(&resolver, &mut state)? else {
            return Ok(IterationOutcome::Idle);
        };

        let harness = self.harness();
        let branches = StackManager::new(self.deps.vcs, self.deps.stack, &config.base_branch);
        let reconciler = Reconciler::new(self.deps.vcs, self.deps.stack, &branches);
        let heuristic = HeuristicClassifier;
        let model_tier = ModelClassifier::new(
            &harness,
            config.models.classifier.clone(),
            config.prompt_budget_bytes,
        );
        let classifiers = ClassifierChain::new().with(&heuristic).with(&model_tier);
        let executor = RemediationExecutor::new(self.deps.vcs, self.deps.stack, self.deps.tracker);
        let health = self.health_monitor();

        let mut run = TaskRun {
            deps: self.deps,
            config,
            harness: &harness,
            health: &health,
            resolver: &resolver,
            branches: &branches,
            reconciler: &reconciler,
            classifiers: &classifiers,
            executor: &executor,
            state,
            task,
            phase: Phase::PickTask,
            epic: None,
            branch: None,
            parent: None,
        };
        let outcome = run.drive()?;
        info!(outcome = %outcome, "iteration finished");
        Ok(outcome)
    }

    /// Baseline validation outside a task, persisting the health log.
    pub fn preflight(&self) -> Result<PreflightOutcome> {
        let mut state = self.deps.store.load()?;
        let outcome = self
            .health_monitor()
            .preflight_check(&mut state, Utc::now())?;
        self.deps.store.save(&state)?;
        Ok(outcome)
    }

    /// Classify error text the way a failing step would.
    pub fn classify(&self, phase: Phase, task_id: &str, error_text: &str) -> Classification {
        let harness = self.harness();
        let heuristic = HeuristicClassifier;
        let model_tier = ModelClassifier::new(
            &harness,
            self.config.models.classifier.clone(),
            self.config.prompt_budget_bytes,
        );
        ClassifierChain::new()
            .with(&heuristic)
            .with(&model_tier)
            .classify(&FailureContext {
                phase,
                task_id,
                error_text,
            })
    }

    /// Drop the current-task marker (used on shutdown).
    pub fn clear_marker(&self) -> Result<()> {
        let mut state = self.deps.store.load()?;
        if state.current_task.take().is_some() {
            self.deps.store.save(&state)?;
            debug!("current-task marker cleared");
        }
        Ok(())
    }

    fn harness(&self) -> Harness<'a> {
        Harness::new(
            self.deps.model,
            self.deps.sleeper,
            self.config.backoff(),
            self.config.model_max_retries,
        )
    }

    fn health_monitor(&self) -> HealthMonitor<'a> {
        HealthMonitor::new(
            self.deps.validator,
            self.deps.vcs,
            &self.config.base_branch,
            self.config.infra_window(),
            self.config.max_infra_failures as usize,
        )
    }

    /// Resume the marked task if it still exists, else take the next ready one.
    fn pick(&self, resolver: &Resolver<'_>, state: &mut OrchestratorState) -> Result<Option<Task>> {
        if let Some(id) = state.current_task.clone() {
            match self.deps.tracker.show(&id) {
                Ok(task) => {
                    info!(task = %id, "resuming task from marker");
                    return Ok(Some(task));
                }
                Err(err) => {
                    warn!(task = %id, err = %err, "marked task unavailable, clearing marker");
                    state.current_task = None;
                    self.deps.store.save(state)?;
                }
            }
        }
        let Some(task) = resolver.next_task()? else {
            debug!("no ready task");
            return Ok(None);
        };
        info!(task = %task.id, title = %task.title, "picked task");
        state.current_task = Some(task.id.clone());
        self.deps.store.save(state)?;
        Ok(Some(task))
    }
}

/// Where a phase sends the state machine next.
enum Flow<T> {
    Continue(T),
    Exit(IterationOutcome),
    SkipToSubmit,
}

/// Unwrap a `Flow::Continue`, otherwise return the flow from the enclosing phase.
macro_rules! proceed {
    ($flow:expr) => {
        match $flow {
            Flow::Continue(value) => value,
            Flow::Exit(outcome) => return Ok(Flow::Exit(outcome)),
            Flow::SkipToSubmit => return Ok(Flow::SkipToSubmit),
        }
    };
}

/// Per-iteration state: the task, its branch, and the loaded bookkeeping.
struct TaskRun<'r> {
    deps: Collaborators<'r>,
    config: &'r LoopConfig,
    harness: &'r Harness<'r>,
    health: &'r HealthMonitor<'r>,
    resolver: &'r Resolver<'r>,
    branches: &'r StackManager<'r>,
    reconciler: &'r Reconciler<'r>,
    classifiers: &'r ClassifierChain<'r>,
    executor: &'r RemediationExecutor<'r>,
    state: OrchestratorState,
    task: Task,
    /// Phase in progress; an error escaping it is attributed here.
    phase: Phase,
    epic: Option<Task>,
    branch: Option<String>,
    parent: Option<String>,
}

impl TaskRun<'_> {
    #[instrument(skip_all, fields(task = %self.task.id))]
    fn drive(&mut self) -> Result<IterationOutcome> {
        let failures = self.state.failures(&self.task.id);
        if is_stuck(failures, self.config.max_task_failures) {
            let reason = format!(
                "failed {failures} times (limit {}), not retrying",
                self.config.max_task_failures
            );
            return self.block(Phase::PickTask, &reason, false);
        }
        match self.advance() {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail(err),
        }
    }

    fn advance(&mut self) -> Result<IterationOutcome> {
        self.epic = self.resolver.resolve_epic(&self.task);
        match self.reconciler.reconcile_all(&self.task, self.epic.as_ref())? {
            ReconcileAction::Skip { reason } => return self.skip(&reason),
            ReconcileAction::Close { pr } => return self.close(pr),
            _ => {}
        }
        if self.task.status != TaskStatus::InProgress {
            self.deps
                .tracker
                .update(&self.task.id, &TaskUpdate::status(TaskStatus::InProgress))?;
            self.task.status = TaskStatus::InProgress;
        }

        let submit_now = match self.prepare()? {
            Flow::Continue(submit_now) => submit_now,
            Flow::Exit(outcome) => return Ok(outcome),
            Flow::SkipToSubmit => true,
        };
        if !submit_now {
            if let Some(outcome) = self.preflight()? {
                return Ok(outcome);
            }
            if let Flow::Exit(outcome) = self.implement_and_gate()? {
                return Ok(outcome);
            }
        }
        self.submit_and_close()
    }

    /// PREPARE_BRANCH. `Continue(true)` means committed work is waiting to be submitted.
    fn prepare(&mut self) -> Result<Flow<bool>> {
        self.phase = Phase::PrepareBranch;
        let dirty = self.reconciler.uncommitted_reconcile()?;
        if !dirty.is_continue() {
            warn!("working tree dirty before task work");
            self.reconciler.apply(&dirty, None)?;
        }

        let result = self
            .branches
            .prepare_branch(&self.task, self.epic.as_ref(), &self.task.title);
        let (Some(branch), Some(parent)) = (result.branch.clone(), result.parent.clone()) else {
            let error = result.error.unwrap_or_else(|| "no branch produced".to_string());
            let reason = format!("branch preparation failed: {error}");
            return Ok(Flow::Exit(self.block(Phase::PrepareBranch, &reason, true)?));
        };
        self.branch = Some(branch.clone());
        self.parent = Some(parent.clone());
        self.remember(|r| {
            r.branch = Some(branch.clone());
            r.parent = Some(parent.clone());
        })?;

        proceed!(self.step(Phase::PrepareBranch, |run| {
            let branch = run.branch()?;
            let action = run.reconciler.graphite_reconcile(branch)?;
            run.reconciler.apply(&action, run.parent.as_deref())
        })?);

        self.phase = Phase::PrepareBranch;
        if result.created {
            return Ok(Flow::Continue(false));
        }
        let work = self.reconciler.work_reconcile(&branch, &parent)?;
        if let ReconcileAction::Submit { .. } = work {
            info!(branch = %branch, "committed work found, going straight to submit");
            return Ok(Flow::Continue(true));
        }
        Ok(Flow::Continue(false))
    }

    /// VALIDATE_PRE. `Some` when the baseline is broken and the task was released.
    fn preflight(&mut self) -> Result<Option<IterationOutcome>> {
        self.phase = Phase::ValidatePre;
        let outcome = self.health.preflight_check(&mut self.state, Utc::now())?;
        self.persist()?;
        match outcome {
            PreflightOutcome::Healthy => Ok(None),
            PreflightOutcome::Degraded { failures, tail } => {
                Ok(Some(self.release_for_infra(false, failures, &tail)?))
            }
            PreflightOutcome::Pause { failures, tail } => {
                Ok(Some(self.release_for_infra(true, failures, &tail)?))
            }
        }
    }

    /// IMPLEMENT, then the VALIDATE_POST / REVIEW / CHECK gates with bounded REPAIR.
    fn implement_and_gate(&mut self) -> Result<Flow<()>> {
        let config = self.config;
        self.phase = Phase::Implement;
        let branch = self.branch()?.to_string();
        let answers = match self.deps.tracker.comments(&self.task.id) {
            Ok(comments) => comments,
            Err(err) => {
                warn!(err = %err, "could not read task comments");
                Vec::new()
            }
        };

        let implementer =
            ImplementerAgent::new(config.models.implementer.clone(), config.prompt_budget_bytes);
        let outcome = proceed!(self.step(Phase::Implement, |run| {
            expect_work(implementer.run(
                run.harness,
                run.deps.vcs,
                &run.task,
                &branch,
                run.epic.as_ref(),
                &answers,
            )?)
        })?);
        if let AgentOutcome::Blocked { reason, questions } = outcome {
            return Ok(Flow::Exit(self.agent_blocked(Phase::Implement, &reason, &questions)?));
        }

        let reviewer =
            ReviewerAgent::new(config.models.reviewer.clone(), config.prompt_budget_bytes);
        let checker = CheckerAgent::new(config.models.checker.clone(), config.prompt_budget_bytes);
        let repairer =
            RepairAgent::new(config.models.implementer.clone(), config.prompt_budget_bytes);
        let _preview = self.start_preview();

        let mut review_pending = config.reviewer_enabled;
        let mut review_comments: Vec<String> = Vec::new();
        let mut repairs = 0;
        loop {
            let report = proceed!(self.step(Phase::ValidatePost, |run| run.deps.validator.validate())?);
            let mut gaps: Vec<String> = Vec::new();
            let mut validation_tail = None;
            if !report.passed {
                info!(exit_code = ?report.exit_code, "post-implementation validation failed");
                gaps.push(format!(
                    "validation command failed (exit {})",
                    report.exit_code.map_or("none".to_string(), |c| c.to_string())
                ));
                validation_tail = Some(report.tail);
            } else {
                let diff = self.deps.vcs.staged_diff()?;
                if review_pending {
                    let verdict = proceed!(self.step(Phase::Review, |run| {
                        reviewer.run(run.harness, &run.task, &diff, config.preview_url.as_deref())
                    })?);
                    review_pending = !verdict.approved;
                    if !verdict.approved {
                        if verdict.comments.is_empty() {
                            gaps.push("reviewer requested changes".to_string());
                        }
                        gaps.extend(verdict.comments.iter().cloned());
                    }
                    review_comments = verdict.comments;
                }
                if gaps.is_empty() && config.checker_enabled {
                    let verdict = proceed!(self.step(Phase::Check, |run| {
                        checker.run(run.harness, &run.task, &diff, &review_comments)
                    })?);
                    gaps.extend(check_gaps(&verdict, config));
                }
            }

            if gaps.is_empty() {
                return Ok(Flow::Continue(()));
            }
            if repairs >= config.max_repair_attempts {
                let mut reason = format!(
                    "still failing after {repairs} repair attempt(s):\n- {}",
                    gaps.join("\n- ")
                );
                if let Some(tail) = &validation_tail {
                    reason.push_str("\n\nvalidation output:\n");
                    reason.push_str(tail);
                }
                return Ok(Flow::Exit(self.block(Phase::Repair, &reason, true)?));
            }
            repairs += 1;
            info!(attempt = repairs, gaps = gaps.len(), "starting repair");
            let outcome = proceed!(self.step(Phase::Repair, |run| {
                expect_work(repairer.run(
                    run.harness,
                    run.deps.vcs,
                    &run.task,
                    &branch,
                    &gaps,
                    validation_tail.as_deref(),
                )?)
            })?);
            if let AgentOutcome::Blocked { reason, questions } = outcome {
                return Ok(Flow::Exit(self.agent_blocked(Phase::Repair, &reason, &questions)?));
            }
        }
    }

    /// SUBMIT then CLOSE.
    fn submit_and_close(&mut self) -> Result<IterationOutcome> {
        let branch = self.branch()?.to_string();
        let message = format!("{}: {}", self.task.id, self.task.title);
        let pr = match self.step(Phase::Submit, |run| run.submit_once(&branch, &message))? {
            Flow::Continue(pr) => pr,
            Flow::Exit(outcome) => return Ok(outcome),
            Flow::SkipToSubmit => bail!("skip-to-submit requested while submitting"),
        };
        info!(pr, branch = %branch, "submitted");
        self.close(pr)
    }

    fn submit_once(&self, branch: &str, message: &str) -> Result<u64> {
        self.deps.vcs.add_all()?;
        self.deps.stack.modify(message)?;
        let result = self.deps.stack.submit()?;
        if let Some(pr) = result.pr_number {
            return Ok(pr);
        }
        if let Some(pr) = self.deps.stack.log()?.pr_for(branch) {
            return Ok(pr);
        }
        Err(anyhow!(
            "submit reported no PR number:\n{}",
            tail_lines(&result.output, REASON_TAIL_LINES)
        ))
    }

    /// Run `attempt`, handling failures through classification and remediation.
    fn step<T>(
        &mut self,
        phase: Phase,
        mut attempt: impl FnMut(&Self) -> Result<T>,
    ) -> Result<Flow<T>> {
        self.phase = phase;
        let mut failures = 0;
        loop {
            let err = match attempt(self) {
                Ok(value) => return Ok(Flow::Continue(value)),
                Err(err) => err,
            };
            failures += 1;
            let error_text = format!("{err:#}");
            warn!(phase = %phase, attempt = failures, err = %error_text, "step failed");

            let classification = self.classifiers.classify(&FailureContext {
                phase,
                task_id: &self.task.id,
                error_text: &error_text,
            });
            let confirmed_pr = self.confirmed_pr();
            let results = self.executor.execute_all(
                &classification.actions,
                &ExecutionContext {
                    task_id: &self.task.id,
                    branch: self.branch.as_deref(),
                    parent: self.parent.as_deref(),
                    confirmed_pr,
                    diagnosis: &classification.diagnosis,
                },
            );
            for result in &results {
                info!(phase = %phase, result = %result, "remediation");
            }
            let has = |wanted: ActionResult| results.contains(&wanted);

            if let Some(pr) = confirmed_pr {
                if has(ActionResult::Applied(RemediationAction::CloseTask)) {
                    return Ok(Flow::Exit(self.closed(pr)?));
                }
                if has(ActionResult::Control(RemediationAction::SkipToClose)) {
                    return Ok(Flow::Exit(self.close(pr)?));
                }
            }
            let reason = failure_reason(phase, &classification, &error_text);
            if has(ActionResult::Applied(RemediationAction::BlockTask)) {
                return Ok(Flow::Exit(self.blocked_by_remediation(phase, &reason)?));
            }
            if phase != Phase::Submit && has(ActionResult::Control(RemediationAction::SkipToSubmit)) {
                info!(phase = %phase, "skipping to submit");
                return Ok(Flow::SkipToSubmit);
            }
            if classification.retryable && !classification.needs_human {
                if failures <= self.config.max_step_retries {
                    if !has(ActionResult::Control(RemediationAction::RetryImmediately)) {
                        let delay = self.config.retry_delay();
                        info!(phase = %phase, delay_secs = delay.as_secs(), "retrying step after delay");
                        self.deps.sleeper.sleep(delay);
                    }
                    continue;
                }
                return Ok(Flow::Exit(self.release(phase, &reason)?));
            }
            return Ok(Flow::Exit(self.block(phase, &reason, true)?));
        }
    }

    /// CLOSE, at most once: re-reads the task and never closes it twice.
    fn close(&mut self, pr: u64) -> Result<IterationOutcome> {
        self.phase = Phase::Close;
        self.remember(|r| r.pr = Some(pr))?;
        let fresh = self.deps.tracker.show(&self.task.id)?;
        if fresh.status == TaskStatus::Closed {
            info!(pr, "task already closed");
        } else {
            self.deps
                .tracker
                .close(&self.task.id, &format!("PR #{pr}"))?;
            info!(pr, "task closed");
        }
        self.closed(pr)
    }

    /// Bookkeeping after the task was closed.
    fn closed(&mut self, pr: u64) -> Result<IterationOutcome> {
        self.state.clear_failures(&self.task.id);
        self.state.current_task = None;
        self.persist()?;
        self.maybe_close_epic();
        Ok(IterationOutcome::Closed {
            task_id: self.task.id.clone(),
            pr,
        })
    }

    /// Close the epic once no remote branches and no ready children remain.
    fn maybe_close_epic(&self) {
        let Some(epic) = &self.epic else {
            return;
        };
        if let Err(err) = self.try_close_epic(epic) {
            warn!(epic = %epic.id, err = %format!("{err:#}"), "epic close check failed");
        }
    }

    fn try_close_epic(&self, epic: &Task) -> Result<()> {
        if let Err(err) = self.deps.vcs.fetch(None) {
            warn!(err = %err, "fetch before epic check failed");
        }
        let remote = self
            .deps
            .vcs
            .list_branches(&branch_namespace(Some(&epic.id)))?
            .iter()
            .filter(|b| b.remote)
            .count();
        let ready = self.resolver.ready_children(&epic.id)?.len();
        if remote > 0 || ready > 0 {
            debug!(epic = %epic.id, remote, ready, "epic stays open");
            return Ok(());
        }
        if self.deps.tracker.show(&epic.id)?.status == TaskStatus::Closed {
            return Ok(());
        }
        self.deps
            .tracker
            .close(&epic.id, "all child branches merged")?;
        info!(epic = %epic.id, "epic closed");
        Ok(())
    }

    fn skip(&mut self, reason: &str) -> Result<IterationOutcome> {
        info!(reason, "task skipped");
        self.state.current_task = None;
        self.persist()?;
        Ok(IterationOutcome::Skipped {
            task_id: self.task.id.clone(),
            reason: reason.to_string(),
        })
    }

    /// BLOCKED: stash leftovers, write the reason onto the task.
    fn block(&mut self, phase: Phase, reason: &str, counts: bool) -> Result<IterationOutcome> {
        self.park_worktree("blocked");
        let note = format!("[conductor] blocked during {phase}: {reason}");
        self.deps
            .tracker
            .update(&self.task.id, &TaskUpdate::blocked(note.clone()))?;
        self.finish_blocked(phase, note, counts)
    }

    /// An error escaped the current phase. The failure is counted and persisted
    /// before anything else. Outside CLOSE the task is then blocked with the
    /// error as its note. A CLOSE error is returned with the marker kept, so
    /// the next iteration resumes the close instead of resubmitting.
    fn fail(&mut self, err: anyhow::Error) -> Result<IterationOutcome> {
        let phase = self.phase;
        let reason = format!("{err:#}");
        let failures = self.state.record_failure(&self.task.id);
        warn!(phase = %phase, failures, err = %reason, "collaborator error");
        self.persist()?;
        if phase == Phase::Close {
            return Err(err);
        }
        self.park_worktree("failed");
        let note = format!(
            "[conductor] blocked during {phase}: {}",
            tail_lines(&reason, REASON_TAIL_LINES)
        );
        self.deps
            .tracker
            .update(&self.task.id, &TaskUpdate::blocked(note.clone()))
            .with_context(|| format!("write failure note on {} after: {reason}", self.task.id))?;
        self.state.current_task = None;
        self.persist()?;
        Ok(IterationOutcome::Blocked {
            task_id: self.task.id.clone(),
            reason: note,
        })
    }

    /// The remediation executor already blocked the task in the tracker.
    fn blocked_by_remediation(&mut self, phase: Phase, reason: &str) -> Result<IterationOutcome> {
        self.park_worktree("blocked");
        self.finish_blocked(phase, reason.to_string(), true)
    }

    /// The agent declared it cannot proceed. Not counted as a failure.
    fn agent_blocked(
        &mut self,
        phase: Phase,
        reason: &str,
        questions: &[String],
    ) -> Result<IterationOutcome> {
        let mut note = format!("[conductor] agent blocked during {phase}: {reason}");
        if !questions.is_empty() {
            note.push_str("\n\nQuestions:\n- ");
            note.push_str(&questions.join("\n- "));
            if let Err(err) = self
                .deps
                .tracker
                .add_comment(&self.task.id, &format!("Questions:\n- {}", questions.join("\n- ")))
            {
                warn!(err = %err, "could not post agent questions");
            }
        }
        self.park_worktree("agent blocked");
        self.deps
            .tracker
            .update(&self.task.id, &TaskUpdate::blocked(note.clone()))?;
        self.finish_blocked(phase, note, false)
    }

    fn finish_blocked(
        &mut self,
        phase: Phase,
        reason: String,
        counts: bool,
    ) -> Result<IterationOutcome> {
        if counts {
            let failures = self.state.record_failure(&self.task.id);
            debug!(failures, "task failure recorded");
        }
        self.state.current_task = None;
        self.persist()?;
        warn!(phase = %phase, reason = %reason, "task blocked");
        Ok(IterationOutcome::Blocked {
            task_id: self.task.id.clone(),
            reason,
        })
    }

    /// Transient failure outlasted its retries: hand the task back as open.
    fn release(&mut self, phase: Phase, reason: &str) -> Result<IterationOutcome> {
        self.park_worktree("released");
        let note = format!("[conductor] released during {phase}: {reason}");
        self.deps.tracker.update(
            &self.task.id,
            &TaskUpdate {
                status: Some(TaskStatus::Open),
                notes: Some(note.clone()),
                external_ref: None,
            },
        )?;
        self.state.record_failure(&self.task.id);
        self.state.current_task = None;
        self.persist()?;
        warn!(phase = %phase, "task released");
        Ok(IterationOutcome::Released {
            task_id: self.task.id.clone(),
            reason: note,
        })
    }

    /// Baseline broken: not the task's fault, so no failure is counted.
    fn release_for_infra(
        &mut self,
        paused: bool,
        failures: usize,
        tail: &str,
    ) -> Result<IterationOutcome> {
        let note = format!(
            "[conductor] released: baseline validation failing ({failures} infra failure(s) this window)\n{}",
            tail_lines(tail, REASON_TAIL_LINES)
        );
        self.deps.tracker.update(
            &self.task.id,
            &TaskUpdate {
                status: Some(TaskStatus::Open),
                notes: Some(note),
                external_ref: None,
            },
        )?;
        self.state.current_task = None;
        self.persist()?;
        Ok(IterationOutcome::InfraFailure {
            task_id: self.task.id.clone(),
            paused,
        })
    }

    /// PR confirmed independently of any classifier: stored reference or stack log.
    fn confirmed_pr(&self) -> Option<u64> {
        let stored = self
            .task
            .external_ref
            .as_deref()
            .map(ExternalRef::parse)
            .and_then(|r| r.pr);
        if stored.is_some() {
            return stored;
        }
        let branch = self.branch.as_deref()?;
        match self.deps.stack.log() {
            Ok(log) => log.pr_for(branch),
            Err(err) => {
                debug!(err = %err, "stack log unavailable while confirming PR");
                None
            }
        }
    }

    /// Update the task's external reference when `edit` changes it.
    fn remember(&mut self, edit: impl FnOnce(&mut ExternalRef)) -> Result<()> {
        let mut reference = self
            .task
            .external_ref
            .as_deref()
            .map(ExternalRef::parse)
            .unwrap_or_default();
        let before = reference.clone();
        edit(&mut reference);
        if reference == before {
            return Ok(());
        }
        let rendered = reference.render();
        self.deps.tracker.update(
            &self.task.id,
            &TaskUpdate {
                external_ref: Some(rendered.clone()),
                ..TaskUpdate::default()
            },
        )?;
        self.task.external_ref = Some(rendered);
        Ok(())
    }

    fn park_worktree(&self, why: &str) {
        match self
            .deps
            .vcs
            .stash(&format!("conductor: {} {why}", self.task.id))
        {
            Ok(true) => info!(why, "stashed uncommitted work"),
            Ok(false) => {}
            Err(err) => warn!(err = %err, "could not stash uncommitted work"),
        }
    }

    fn start_preview(&self) -> Option<BackgroundProcess> {
        if !self.config.reviewer_enabled {
            return None;
        }
        let command = self.config.preview_command.as_deref()?;
        match BackgroundProcess::spawn("preview", command, &self.config.repo_root, DEFAULT_GRACE) {
            Ok(process) => Some(process),
            Err(err) => {
                warn!(err = %err, "preview server did not start, reviewing without it");
                None
            }
        }
    }

    fn branch(&self) -> Result<&str> {
        self.branch
            .as_deref()
            .ok_or_else(|| anyhow!("no task branch prepared"))
    }

    fn persist(&self) -> Result<()> {
        self.deps
            .store
            .save(&self.state)
            .context("save orchestrator state")
    }
}

/// Agent errors become step failures; success and agent blocks pass through.
fn expect_work(outcome: AgentOutcome) -> Result<AgentOutcome> {
    match outcome {
        AgentOutcome::Error(err) => Err(err.into()),
        other => Ok(other),
    }
}

fn check_gaps(verdict: &CheckVerdict, config: &LoopConfig) -> Vec<String> {
    if verdict.passes(config.min_confidence, config.min_coverage) {
        return Vec::new();
    }
    let mut gaps = verdict.gaps.clone();
    if verdict.complete {
        if verdict.confidence < config.min_confidence {
            gaps.push(format!(
                "checker confidence {:.2} is below {:.2}",
                verdict.confidence, config.min_confidence
            ));
        }
        if config.min_coverage > 0.0 && verdict.coverage.is_none_or(|c| c < config.min_coverage) {
            gaps.push(format!(
                "coverage {} is below {:.2}",
                verdict
                    .coverage
                    .map_or("unknown".to_string(), |c| format!("{c:.2}")),
                config.min_coverage
            ));
        }
    }
    gaps
}

fn failure_reason(phase: Phase, classification: &Classification, error_text: &str) -> String {
    format!(
        "{phase} failed ({}): {}\n\n{}",
        classification.failure_class,
        classification.diagnosis,
        tail_lines(error_text, REASON_TAIL_LINES)
    )
}
