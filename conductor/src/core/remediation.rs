//! The remediation allowlist.
//!
//! Classifiers propose action names as strings. Only names that parse into a
//! [`RemediationAction`] can ever be executed; everything else is rejected.

use std::fmt;

/// Every recovery action the orchestrator knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemediationAction {
    /// `gt sync`
    Sync,
    /// `gt restack`
    Restack,
    /// `gt track --force` on the current task branch
    ForceTrack,
    /// `git fetch <remote>`
    Fetch,
    /// `git pull --rebase` on the current branch
    PullRebase,
    /// `git stash push` (work is preserved, never discarded)
    Stash,
    /// `git rebase --abort`
    AbortRebase,
    /// checkout the task branch
    Checkout,
    /// mark the task blocked with the diagnosis
    BlockTask,
    /// close the task; requires an independently confirmed PR
    CloseTask,
    /// sleep, then retry the failed step
    RetryWithDelay,
    /// retry the failed step immediately
    RetryImmediately,
    /// jump to CLOSE; requires an independently confirmed PR
    SkipToClose,
    /// jump to SUBMIT
    SkipToSubmit,
    /// surface the diagnosis to a human
    NotifyHuman,
    NoOp,
}

impl RemediationAction {
    pub const ALL: [RemediationAction; 16] = [
        Self::Sync,
        Self::Restack,
        Self::ForceTrack,
        Self::Fetch,
        Self::PullRebase,
        Self::Stash,
        Self::AbortRebase,
        Self::Checkout,
        Self::BlockTask,
        Self::CloseTask,
        Self::RetryWithDelay,
        Self::RetryImmediately,
        Self::SkipToClose,
        Self::SkipToSubmit,
        Self::NotifyHuman,
        Self::NoOp,
    ];

    /// Canonical action name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "GT_SYNC",
            Self::Restack => "GT_RESTACK",
            Self::ForceTrack => "GT_TRACK_FORCE",
            Self::Fetch => "GIT_FETCH",
            Self::PullRebase => "GIT_PULL_REBASE",
            Self::Stash => "GIT_STASH",
            Self::AbortRebase => "GIT_ABORT_REBASE",
            Self::Checkout => "GIT_CHECKOUT",
            Self::BlockTask => "BD_BLOCK",
            Self::CloseTask => "BD_CLOSE",
            Self::RetryWithDelay => "RETRY_WITH_DELAY",
            Self::RetryImmediately => "RETRY_IMMEDIATELY",
            Self::SkipToClose => "SKIP_TO_CLOSE",
            Self::SkipToSubmit => "SKIP_TO_SUBMIT",
            Self::NotifyHuman => "NOTIFY_HUMAN",
            Self::NoOp => "NO_OP",
        }
    }

    /// Parse an action name. Accepts the canonical names and the short kebab
    /// aliases (`sync`, `force-track`, `retry-with-delay`, ...). Anything else is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        if let Some(action) = Self::ALL.into_iter().find(|a| a.name() == normalized) {
            return Some(action);
        }
        let alias = match normalized.as_str() {
            "SYNC" => Self::Sync,
            "RESTACK" => Self::Restack,
            "FORCE_TRACK" | "TRACK" => Self::ForceTrack,
            "FETCH" => Self::Fetch,
            "PULL_REBASE" => Self::PullRebase,
            "STASH" => Self::Stash,
            "ABORT_REBASE" => Self::AbortRebase,
            "CHECKOUT" => Self::Checkout,
            "BLOCK_TASK" => Self::BlockTask,
            "CLOSE_TASK" => Self::CloseTask,
            "NOOP" => Self::NoOp,
            _ => return None,
        };
        Some(alias)
    }

    /// Control signals are consumed by the state machine and have no side effect.
    pub fn is_control_signal(&self) -> bool {
        matches!(
            self,
            Self::RetryWithDelay | Self::RetryImmediately | Self::SkipToClose | Self::SkipToSubmit
        )
    }

    /// Actions that close a task need an independently confirmed PR.
    pub fn requires_confirmed_pr(&self) -> bool {
        matches!(self, Self::CloseTask | Self::SkipToClose)
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
