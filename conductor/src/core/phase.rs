//! Pipeline phases of a single task lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of the orchestration state machine.
///
/// `Blocked` and `Skipped` are absorbing exits reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    PickTask,
    PrepareBranch,
    ValidatePre,
    Implement,
    ValidatePost,
    Review,
    Check,
    Repair,
    Submit,
    Close,
    Blocked,
    Skipped,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Self::PickTask,
        Self::PrepareBranch,
        Self::ValidatePre,
        Self::Implement,
        Self::ValidatePost,
        Self::Review,
        Self::Check,
        Self::Repair,
        Self::Submit,
        Self::Close,
        Self::Blocked,
        Self::Skipped,
    ];

    /// Accepts `SUBMIT`, `submit`, or `validate-post` style names.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL.into_iter().find(|p| p.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PickTask => "PICK_TASK",
            Self::PrepareBranch => "PREPARE_BRANCH",
            Self::ValidatePre => "VALIDATE_PRE",
            Self::Implement => "IMPLEMENT",
            Self::ValidatePost => "VALIDATE_POST",
            Self::Review => "REVIEW",
            Self::Check => "CHECK",
            Self::Repair => "REPAIR",
            Self::Submit => "SUBMIT",
            Self::Close => "CLOSE",
            Self::Blocked => "BLOCKED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close | Self::Blocked | Self::Skipped)
    }

    /// Default successor on the happy path, honoring the reviewer/checker toggles.
    pub fn next(&self, reviewer_enabled: bool, checker_enabled: bool) -> Phase {
        match self {
            Self::PickTask => Self::PrepareBranch,
            Self::PrepareBranch => Self::ValidatePre,
            Self::ValidatePre => Self::Implement,
            Self::Implement => Self::ValidatePost,
            Self::ValidatePost if reviewer_enabled => Self::Review,
            Self::ValidatePost | Self::Review if checker_enabled => Self::Check,
            Self::ValidatePost | Self::Review | Self::Check => Self::Submit,
            Self::Repair => Self::ValidatePost,
            Self::Submit => Self::Close,
            Self::Close => Self::Close,
            Self::Blocked => Self::Blocked,
            Self::Skipped => Self::Skipped,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_visits_every_gate() {
        let mut phase = Phase::PickTask;
        let mut seen = vec![phase];
        while !phase.is_terminal() {
            phase = phase.next(true, true);
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::PickTask,
                Phase::PrepareBranch,
                Phase::ValidatePre,
                Phase::Implement,
                Phase::ValidatePost,
                Phase::Review,
                Phase::Check,
                Phase::Submit,
                Phase::Close,
            ]
        );
    }

    #[test]
    fn disabled_gates_are_skipped() {
        assert_eq!(Phase::ValidatePost.next(false, true), Phase::Check);
        assert_eq!(Phase::ValidatePost.next(false, false), Phase::Submit);
        assert_eq!(Phase::Review.next(true, false), Phase::Submit);
    }

    #[test]
    fn parse_accepts_cli_spellings() {
        assert_eq!(Phase::parse("validate-post"), Some(Phase::ValidatePost));
        assert_eq!(Phase::parse(" SUBMIT"), Some(Phase::Submit));
        assert_eq!(Phase::parse("deploy"), None);
    }

    #[test]
    fn absorbing_states_stay_put() {
        assert_eq!(Phase::Blocked.next(true, true), Phase::Blocked);
        assert_eq!(Phase::Skipped.next(true, true), Phase::Skipped);
    }
}
