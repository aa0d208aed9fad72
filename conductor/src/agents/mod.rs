//! Agent roles on top of the invocation harness.
//!
//! Each role renders its prompt, invokes its model through the [`harness`], and
//! parses the reply into a typed value exactly once.

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::report::{ReportStatus, WorkReport, parse_report};
use crate::core::types::{AgentError, AgentErrorKind, AgentOutcome};
use crate::io::git::Vcs;

pub mod checker;
pub mod classifier;
pub mod harness;
pub mod implementer;
pub mod repair;
pub mod reviewer;

/// Map an invocation failure onto an [`AgentOutcome`].
pub(crate) fn invocation_failed(err: &anyhow::Error) -> AgentOutcome {
    AgentOutcome::Error(AgentError {
        kind: AgentErrorKind::Invocation,
        message: format!("{err:#}"),
    })
}

/// Turn a work-session reply into an outcome, staging whatever the agent left.
///
/// A `done` report must leave a non-empty staged diff. A missing report is
/// tolerated when the agent did produce changes.
pub(crate) fn finish_work_session(vcs: &dyn Vcs, reply: &str) -> Result<AgentOutcome> {
    let report = match parse_report::<WorkReport>(reply) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(err = %err, "agent reply carried no valid report");
            None
        }
    };

    if let Some(report) = &report
        && report.status == ReportStatus::Blocked
    {
        let reason = if report.reason.trim().is_empty() {
            report.summary.clone()
        } else {
            report.reason.clone()
        };
        return Ok(AgentOutcome::Blocked {
            reason,
            questions: report.questions.clone(),
        });
    }

    vcs.add_all()?;
    let diff = vcs.staged_diff()?;
    debug!(diff_bytes = diff.len(), "staged agent changes");
    if !diff.trim().is_empty() {
        return Ok(AgentOutcome::Success {
            diff,
            summary: report.map(|r| r.summary).unwrap_or_default(),
        });
    }
    let error = if report.is_some() {
        AgentError {
            kind: AgentErrorKind::NoChanges,
            message: "agent reported done but the working tree is unchanged".to_string(),
        }
    } else {
        AgentError {
            kind: AgentErrorKind::MalformedReport,
            message: "agent reply carried no report and made no changes".to_string(),
        }
    };
    Ok(AgentOutcome::Error(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeVcs;

    #[test]
    fn done_without_changes_is_no_changes_error() {
        let vcs = FakeVcs::new("agent/T1-x");
        let outcome = finish_work_session(&vcs, r#"{"status":"done","summary":"nothing"}"#)
            .expect("outcome");
        let AgentOutcome::Error(err) = outcome else {
            panic!("expected error, got {outcome:?}");
        };
        assert_eq!(err.kind, AgentErrorKind::NoChanges);
    }

    #[test]
    fn blocked_report_skips_staging() {
        let vcs = FakeVcs::new("agent/T1-x");
        vcs.set_worktree_diff("+partial");
        let reply = r#"{"status":"blocked","reason":"need creds","questions":["which key?"]}"#;
        let outcome = finish_work_session(&vcs, reply).expect("outcome");
        assert_eq!(
            outcome,
            AgentOutcome::Blocked {
                reason: "need creds".to_string(),
                questions: vec!["which key?".to_string()],
            }
        );
        assert_eq!(vcs.staged(), "");
    }

    #[test]
    fn missing_report_with_changes_is_success() {
        let vcs = FakeVcs::new("agent/T1-x");
        vcs.set_worktree_diff("+fn foo() {}");
        let outcome = finish_work_session(&vcs, "all done, no json").expect("outcome");
        assert!(matches!(outcome, AgentOutcome::Success { .. }));
    }

    #[test]
    fn missing_report_without_changes_is_malformed() {
        let vcs = FakeVcs::new("agent/T1-x");
        let outcome = finish_work_session(&vcs, "hmm").expect("outcome");
        let AgentOutcome::Error(err) = outcome else {
            panic!("expected error");
        };
        assert_eq!(err.kind, AgentErrorKind::MalformedReport);
    }
}
