//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the adapters and the pipeline.
//! Raw collaborator output is parsed into these types once, at the adapter
//! boundary; nothing downstream re-parses text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tracker-owned task status. The orchestrator only reads and transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    /// Parse a tracker status string. Unrecognized values are treated as open.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "in_progress" => Self::InProgress,
            "blocked" => Self::Blocked,
            "closed" | "done" => Self::Closed,
            _ => Self::Open,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Tracker issue type (`task`, `bug`, `feature`, `epic`, ...).
    pub issue_type: String,
    pub description: String,
    /// Ids of tasks this task depends on (includes its parent epic, if any).
    pub dependencies: Vec<String>,
    /// Encoded branch name and/or PR number, see [`crate::core::naming::ExternalRef`].
    pub external_ref: Option<String>,
    /// Free text; holds the blocker explanation when blocked.
    pub notes: String,
}

impl Task {
    pub fn is_epic(&self) -> bool {
        self.issue_type.eq_ignore_ascii_case("epic")
    }
}

/// A comment attached to a task in the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
}

/// Status/notes/reference change applied to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub notes: Option<String>,
    pub external_ref: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn blocked(notes: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Blocked),
            notes: Some(notes.into()),
            external_ref: None,
        }
    }
}

/// Typed result of an implementer or repair agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// The agent finished and left a non-empty staged diff.
    Success { diff: String, summary: String },
    /// The agent declared it cannot proceed.
    Blocked {
        reason: String,
        questions: Vec<String>,
    },
    /// The session failed.
    Error(AgentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    /// Model invocation failed (after harness retries, where applicable).
    Invocation,
    /// The agent reported done but the working tree has no changes.
    NoChanges,
    /// The agent reply carried no parseable report.
    MalformedReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AgentErrorKind::Invocation => "agent invocation failed",
            AgentErrorKind::NoChanges => "agent produced no changes",
            AgentErrorKind::MalformedReport => "agent report malformed",
        };
        write!(f, "{kind}: {}", self.message)
    }
}

impl std::error::Error for AgentError {}

/// Reviewer verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub comments: Vec<String>,
}

/// Checker verdict on completeness of the implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub complete: bool,
    pub confidence: f64,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl CheckVerdict {
    /// True when the verdict clears the configured thresholds.
    ///
    /// `min_coverage <= 0.0` disables the coverage gate.
    pub fn passes(&self, min_confidence: f64, min_coverage: f64) -> bool {
        if !self.complete || self.confidence < min_confidence {
            return false;
        }
        if min_coverage > 0.0 {
            return self.coverage.is_some_and(|c| c >= min_coverage);
        }
        true
    }
}

/// Outcome of running the validation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Last lines of combined stdout/stderr, surfaced verbatim in blocked notes.
    pub tail: String,
}

/// Closed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    RateLimit,
    GraphiteDrift,
    PrExists,
    BranchExists,
    MergeConflict,
    AuthFailure,
    ValidationFailure,
    ImplementationGap,
    NetworkError,
    Unknown,
}

impl FailureClass {
    pub const ALL: [FailureClass; 10] = [
        Self::RateLimit,
        Self::GraphiteDrift,
        Self::PrExists,
        Self::BranchExists,
        Self::MergeConflict,
        Self::AuthFailure,
        Self::ValidationFailure,
        Self::ImplementationGap,
        Self::NetworkError,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::GraphiteDrift => "GRAPHITE_DRIFT",
            Self::PrExists => "PR_EXISTS",
            Self::BranchExists => "BRANCH_EXISTS",
            Self::MergeConflict => "MERGE_CONFLICT",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::ValidationFailure => "VALIDATION_FAILURE",
            Self::ImplementationGap => "IMPLEMENTATION_GAP",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a class name; returns `None` for anything outside the enumeration.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnosis of a step failure. Produced by a classifier, never executed by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub failure_class: FailureClass,
    pub retryable: bool,
    /// Ordered remediation action names; validated against the allowlist at execution.
    pub actions: Vec<String>,
    pub needs_human: bool,
    pub diagnosis: String,
}

impl Classification {
    /// The fallback classification for anything that cannot be diagnosed.
    pub fn unknown(diagnosis: impl Into<String>) -> Self {
        Self {
            failure_class: FailureClass::Unknown,
            retryable: false,
            actions: vec!["NOTIFY_HUMAN".to_string()],
            needs_human: true,
            diagnosis: diagnosis.into(),
        }
    }
}

/// Outcome of a reconciliation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing to redirect; proceed with the default step.
    Continue,
    /// Task must not be worked on.
    Skip { reason: String },
    /// A PR already exists; close the task without resubmitting.
    Close { pr: u64 },
    /// A branch already exists for the task; reuse it.
    UseExisting { branch: String },
    /// Work already exists on the branch; go straight to submit.
    Submit { branch: String },
    /// The working tree is dirty; stash before proceeding.
    Stash,
    /// The branch is unknown to the stack tool; track it.
    Track { branch: String },
    /// The stack has diverged; restack.
    Restack,
}

impl ReconcileAction {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_class_parse_accepts_only_closed_set() {
        assert_eq!(FailureClass::parse("rate_limit"), Some(FailureClass::RateLimit));
        assert_eq!(
            FailureClass::parse("graphite-drift"),
            Some(FailureClass::GraphiteDrift)
        );
        assert_eq!(FailureClass::parse("DISK_FULL"), None);
        assert_eq!(FailureClass::parse(""), None);
    }

    #[test]
    fn task_status_parse_defaults_to_open() {
        assert_eq!(TaskStatus::parse("in_progress"), TaskStatus::InProgress);
        assert_eq!(TaskStatus::parse("in-progress"), TaskStatus::InProgress);
        assert_eq!(TaskStatus::parse("Closed"), TaskStatus::Closed);
        assert_eq!(TaskStatus::parse("weird"), TaskStatus::Open);
    }

    #[test]
    fn check_verdict_applies_thresholds() {
        let verdict = CheckVerdict {
            complete: true,
            confidence: 0.85,
            coverage: None,
            gaps: Vec::new(),
        };
        assert!(verdict.passes(0.8, 0.0));
        assert!(!verdict.passes(0.9, 0.0));
        assert!(!verdict.passes(0.8, 0.7), "coverage gate requires a reported value");

        let incomplete = CheckVerdict {
            complete: false,
            ..verdict
        };
        assert!(!incomplete.passes(0.0, 0.0));
    }
}
