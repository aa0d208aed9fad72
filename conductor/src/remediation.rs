//! Failure classification chain and allowlisted remediation execution.
//!
//! Classifiers only diagnose. Every proposed action name is resolved against
//! [`RemediationAction`] at execution time; names outside the allowlist are
//! rejected and cause no side effect.

use std::fmt;

use tracing::{info, instrument, warn};

use crate::core::classifier::{MAX_PROPOSED_ACTIONS, classify_heuristic};
use crate::core::phase::Phase;
use crate::core::remediation::RemediationAction;
use crate::core::types::{Classification, TaskUpdate};
use crate::io::git::Vcs;
use crate::io::graphite::StackTool;
use crate::io::tracker::Tracker;

/// What a classifier gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub phase: Phase,
    pub task_id: &'a str,
    pub error_text: &'a str,
}

/// One tier of the classification chain.
pub trait Classifier {
    fn name(&self) -> &'static str;
    /// `None` passes the failure to the next tier.
    fn classify(&self, ctx: &FailureContext<'_>) -> Option<Classification>;
}

/// Pattern tier; never calls a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn classify(&self, ctx: &FailureContext<'_>) -> Option<Classification> {
        classify_heuristic(ctx.error_text)
    }
}

/// Ordered tiers; the first classification wins.
#[derive(Default)]
pub struct ClassifierChain<'a> {
    tiers: Vec<&'a dyn Classifier>,
}

impl<'a> ClassifierChain<'a> {
    pub fn new() -> Self {
        Self { tiers: Vec::new() }
    }

    pub fn with(mut self, tier: &'a dyn Classifier) -> Self {
        self.tiers.push(tier);
        self
    }

    #[instrument(skip_all, fields(phase = %ctx.phase, task = ctx.task_id))]
    pub fn classify(&self, ctx: &FailureContext<'_>) -> Classification {
        for tier in &self.tiers {
            if let Some(classification) = tier.classify(ctx) {
                info!(
                    tier = tier.name(),
                    class = %classification.failure_class,
                    retryable = classification.retryable,
                    actions = ?classification.actions,
                    "failure classified"
                );
                return classification;
            }
        }
        warn!("no classifier recognized the failure");
        Classification::unknown(format!(
            "unrecognized failure during {}",
            ctx.phase.as_str()
        ))
    }
}

/// Result of attempting one proposed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Side effect performed.
    Applied(RemediationAction),
    /// Control signal for the state machine; nothing was executed.
    Control(RemediationAction),
    /// Not executed: unknown name or unmet precondition.
    Rejected { name: String, reason: String },
    /// Executed and failed.
    Failed {
        action: RemediationAction,
        error: String,
    },
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied(action) => write!(f, "{action}: applied"),
            Self::Control(action) => write!(f, "{action}: control"),
            Self::Rejected { name, reason } => write!(f, "{name}: rejected ({reason})"),
            Self::Failed { action, error } => write!(f, "{action}: failed ({error})"),
        }
    }
}

/// Task-level facts the executor needs to carry out an action.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext<'a> {
    pub task_id: &'a str,
    pub branch: Option<&'a str>,
    pub parent: Option<&'a str>,
    /// PR confirmed by an independent lookup (tracker reference or stack tool).
    pub confirmed_pr: Option<u64>,
    pub diagnosis: &'a str,
}

pub struct RemediationExecutor<'a> {
    vcs: &'a dyn Vcs,
    stack: &'a dyn StackTool,
    tracker: &'a dyn Tracker,
}

impl<'a> RemediationExecutor<'a> {
    pub fn new(vcs: &'a dyn Vcs, stack: &'a dyn StackTool, tracker: &'a dyn Tracker) -> Self {
        Self { vcs, stack, tracker }
    }

    /// Execute up to [`MAX_PROPOSED_ACTIONS`] proposed actions in order.
    pub fn execute_all(&self, names: &[String], ctx: &ExecutionContext<'_>) -> Vec<ActionResult> {
        if names.len() > MAX_PROPOSED_ACTIONS {
            warn!(proposed = names.len(), "ignoring actions beyond the cap");
        }
        names
            .iter()
            .take(MAX_PROPOSED_ACTIONS)
            .map(|name| self.execute_action(name, ctx))
            .collect()
    }

    #[instrument(skip_all, fields(action = name, task = ctx.task_id))]
    pub fn execute_action(&self, name: &str, ctx: &ExecutionContext<'_>) -> ActionResult {
        let Some(action) = RemediationAction::parse(name) else {
            warn!("rejected action outside the allowlist");
            return ActionResult::Rejected {
                name: name.to_string(),
                reason: "not in the remediation allowlist".to_string(),
            };
        };
        if action.requires_confirmed_pr() && ctx.confirmed_pr.is_none() {
            warn!(%action, "rejected close without a confirmed PR");
            return ActionResult::Rejected {
                name: action.name().to_string(),
                reason: "no confirmed PR".to_string(),
            };
        }
        if action.is_control_signal() {
            return ActionResult::Control(action);
        }
        match self.apply(action, ctx) {
            Ok(Some(reason)) => {
                warn!(%action, reason = %reason, "action precondition not met");
                ActionResult::Rejected {
                    name: action.name().to_string(),
                    reason,
                }
            }
            Ok(None) => {
                info!(%action, "remediation applied");
                ActionResult::Applied(action)
            }
            Err(err) => {
                warn!(%action, err = %err, "remediation failed");
                ActionResult::Failed {
                    action,
                    error: format!("{err:#}"),
                }
            }
        }
    }

    /// Returns `Some(reason)` when the action cannot run in this context.
    fn apply(
        &self,
        action: RemediationAction,
        ctx: &ExecutionContext<'_>,
    ) -> anyhow::Result<Option<String>> {
        match action {
            RemediationAction::Sync => self.stack.sync()?,
            RemediationAction::Restack => self.stack.restack()?,
            RemediationAction::ForceTrack => {
                let Some(branch) = ctx.branch else {
                    return Ok(Some("no task branch".to_string()));
                };
                self.stack.track(branch, ctx.parent, true)?;
            }
            RemediationAction::Fetch => self.vcs.fetch(None)?,
            RemediationAction::PullRebase => {
                let branch = match ctx.branch {
                    Some(branch) => branch.to_string(),
                    None => self.vcs.current_branch()?,
                };
                self.vcs.pull_rebase(&branch)?;
            }
            RemediationAction::Stash => {
                self.vcs
                    .stash(&format!("conductor: remediation for {}", ctx.task_id))?;
            }
            RemediationAction::AbortRebase => self.vcs.abort_rebase()?,
            RemediationAction::Checkout => {
                let Some(branch) = ctx.branch else {
                    return Ok(Some("no task branch".to_string()));
                };
                self.vcs.checkout(branch)?;
            }
            RemediationAction::BlockTask => {
                self.tracker
                    .update(ctx.task_id, &TaskUpdate::blocked(ctx.diagnosis))?;
            }
            RemediationAction::CloseTask => {
                let Some(pr) = ctx.confirmed_pr else {
                    return Ok(Some("no confirmed PR".to_string()));
                };
                self.tracker.close(ctx.task_id, &format!("PR #{pr}"))?;
            }
            RemediationAction::NotifyHuman => {
                self.tracker.add_comment(
                    ctx.task_id,
                    &format!("conductor needs a human: {}", ctx.diagnosis),
                )?;
            }
            RemediationAction::NoOp => {}
            RemediationAction::RetryWithDelay
            | RemediationAction::RetryImmediately
            | RemediationAction::SkipToClose
            | RemediationAction::SkipToSubmit => {}
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureClass;
    use crate::test_support::{FakeStack, FakeTracker, FakeVcs, task};

    struct Fixed(Option<Classification>);

    impl Classifier for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn classify(&self, _ctx: &FailureContext<'_>) -> Option<Classification> {
            self.0.clone()
        }
    }

    fn failure(text: &str) -> FailureContext<'_> {
        FailureContext {
            phase: Phase::Submit,
            task_id: "T1",
            error_text: text,
        }
    }

    #[test]
    fn chain_prefers_heuristics_and_falls_back_to_unknown() {
        let heuristic = HeuristicClassifier;
        let never = Fixed(None);
        let chain = ClassifierChain::new().with(&heuristic).with(&never);

        let c = chain.classify(&failure("HTTP 429 Too Many Requests"));
        assert_eq!(c.failure_class, FailureClass::RateLimit);

        let c = chain.classify(&failure("something odd"));
        assert_eq!(c.failure_class, FailureClass::Unknown);
        assert!(c.needs_human);
    }

    #[test]
    fn later_tier_answers_when_heuristics_miss() {
        let heuristic = HeuristicClassifier;
        let mut answer = Classification::unknown("model says so");
        answer.failure_class = FailureClass::ImplementationGap;
        let model = Fixed(Some(answer));
        let chain = ClassifierChain::new().with(&heuristic).with(&model);
        assert_eq!(
            chain.classify(&failure("tests missing")).failure_class,
            FailureClass::ImplementationGap
        );
    }

    #[test]
    fn unknown_action_is_rejected_without_side_effects() {
        let vcs = FakeVcs::new("agent/T1-x");
        let stack = FakeStack::new(&vcs);
        let tracker = FakeTracker::with_tasks(vec![task("T1")]);
        let executor = RemediationExecutor::new(&vcs, &stack, &tracker);
        let ctx = ExecutionContext {
            task_id: "T1",
            ..ExecutionContext::default()
        };

        let result = executor.execute_action("rm -rf /", &ctx);
        assert!(matches!(result, ActionResult::Rejected { .. }));
        assert!(vcs.calls().is_empty());
        assert!(stack.calls().is_empty());
        assert!(tracker.updates().is_empty());
    }

    #[test]
    fn close_requires_confirmed_pr() {
        let vcs = FakeVcs::new("agent/T1-x");
        let stack = FakeStack::new(&vcs);
        let tracker = FakeTracker::with_tasks(vec![task("T1")]);
        let executor = RemediationExecutor::new(&vcs, &stack, &tracker);

        let unconfirmed = ExecutionContext {
            task_id: "T1",
            ..ExecutionContext::default()
        };
        for name in ["BD_CLOSE", "SKIP_TO_CLOSE"] {
            assert!(matches!(
                executor.execute_action(name, &unconfirmed),
                ActionResult::Rejected { .. }
            ));
        }
        assert!(tracker.closes().is_empty());

        let confirmed = ExecutionContext {
            confirmed_pr: Some(7),
            ..unconfirmed
        };
        assert_eq!(
            executor.execute_action("BD_CLOSE", &confirmed),
            ActionResult::Applied(RemediationAction::CloseTask)
        );
        assert_eq!(tracker.closes(), vec![("T1".to_string(), "PR #7".to_string())]);
    }

    #[test]
    fn control_signals_are_not_executed() {
        let vcs = FakeVcs::new("agent/T1-x");
        let stack = FakeStack::new(&vcs);
        let tracker = FakeTracker::with_tasks(vec![task("T1")]);
        let executor = RemediationExecutor::new(&vcs, &stack, &tracker);
        let ctx = ExecutionContext {
            task_id: "T1",
            ..ExecutionContext::default()
        };
        assert_eq!(
            executor.execute_action("retry-with-delay", &ctx),
            ActionResult::Control(RemediationAction::RetryWithDelay)
        );
        assert!(vcs.calls().is_empty());
    }

    #[test]
    fn executes_at_most_three_actions() {
        let vcs = FakeVcs::new("agent/T1-x");
        let stack = FakeStack::new(&vcs);
        let tracker = FakeTracker::with_tasks(vec![task("T1")]);
        let executor = RemediationExecutor::new(&vcs, &stack, &tracker);
        let ctx = ExecutionContext {
            task_id: "T1",
            branch: Some("agent/T1-x"),
            ..ExecutionContext::default()
        };
        let names: Vec<String> = ["GT_SYNC", "GT_RESTACK", "GIT_FETCH", "GIT_STASH"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let results = executor.execute_all(&names, &ctx);
        assert_eq!(results.len(), 3);
        assert_eq!(stack.calls(), vec!["sync".to_string(), "restack".to_string()]);
        assert_eq!(vcs.calls(), vec!["fetch".to_string()]);
    }

    #[test]
    fn failed_action_is_reported() {
        let vcs = FakeVcs::new("agent/T1-x");
        let stack = FakeStack::new(&vcs);
        stack.fail_next("restack", "conflict in src/lib.rs");
        let tracker = FakeTracker::with_tasks(vec![task("T1")]);
        let executor = RemediationExecutor::new(&vcs, &stack, &tracker);
        let ctx = ExecutionContext {
            task_id: "T1",
            ..ExecutionContext::default()
        };
        let result = executor.execute_action("GT_RESTACK", &ctx);
        assert!(matches!(
            result,
            ActionResult::Failed { action: RemediationAction::Restack, ref error } if error.contains("conflict")
        ));
    }
}
