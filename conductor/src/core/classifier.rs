//! Deterministic failure classification.
//!
//! The heuristic tier matches error text against known patterns and answers
//! without a model call. Model replies are coerced here too, so the closed
//! taxonomy holds no matter which tier produced the classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::core::report::extract_json_object;
use crate::core::types::{Classification, FailureClass};

/// Upper bound on remediation actions a classification may propose.
pub const MAX_PROPOSED_ACTIONS: usize = 3;

struct Pattern {
    class: FailureClass,
    regex: Regex,
    retryable: bool,
    needs_human: bool,
    actions: &'static [&'static str],
    diagnosis: &'static str,
}

fn pattern(
    class: FailureClass,
    re: &str,
    retryable: bool,
    needs_human: bool,
    actions: &'static [&'static str],
    diagnosis: &'static str,
) -> Pattern {
    Pattern {
        class,
        regex: Regex::new(re).expect("valid classifier pattern"),
        retryable,
        needs_human,
        actions,
        diagnosis,
    }
}

// Order matters: the first match wins. Rate limits are checked before network
// errors because provider throttling often surfaces alongside a timeout.
static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        pattern(
            FailureClass::RateLimit,
            r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded|quota exceeded",
            true,
            false,
            &["RETRY_WITH_DELAY"],
            "provider rate limit",
        ),
        pattern(
            FailureClass::PrExists,
            r"(?i)(pull request|\bpr\b)[^\n]*already exists",
            false,
            false,
            &["SKIP_TO_CLOSE"],
            "a pull request already exists for this branch",
        ),
        pattern(
            FailureClass::BranchExists,
            r"(?i)branch[^\n]*already exists|already exists[^\n]*branch",
            true,
            false,
            &["GIT_CHECKOUT"],
            "branch already exists",
        ),
        pattern(
            FailureClass::MergeConflict,
            r"(?m)(?i:CONFLICT \(|merge conflict|could not apply|rebase in progress|unmerged paths)|^<<<<<<< ",
            false,
            true,
            &["GIT_ABORT_REBASE", "BD_BLOCK"],
            "merge conflict requires manual resolution",
        ),
        pattern(
            FailureClass::GraphiteDrift,
            r"(?i)needs restack|not tracked by graphite|untracked branch|diverged from|is not tracked|cannot (find|determine) parent",
            true,
            false,
            &["GT_TRACK_FORCE", "GT_RESTACK"],
            "stack metadata drifted from git state",
        ),
        pattern(
            FailureClass::AuthFailure,
            r"(?i)authentication failed|permission denied \(publickey\)|\b401\b|\b403\b|unauthorized|not logged in|invalid api key|bad credentials",
            false,
            true,
            &["NOTIFY_HUMAN"],
            "authentication failure",
        ),
        pattern(
            FailureClass::NetworkError,
            r"(?i)could not resolve host|connection (refused|reset|timed out)|network is unreachable|timed out|etimedout|econnreset|\b50[234]\b|bad gateway|service unavailable|tls handshake",
            true,
            false,
            &["RETRY_WITH_DELAY"],
            "network error",
        ),
    ]
});

/// Classify error text with the fast pattern tier. `None` means no pattern matched.
pub fn classify_heuristic(error_text: &str) -> Option<Classification> {
    PATTERNS
        .iter()
        .find(|pattern| pattern.regex.is_match(error_text))
        .map(|pattern| Classification {
            failure_class: pattern.class,
            retryable: pattern.retryable,
            actions: pattern.actions.iter().map(|a| (*a).to_string()).collect(),
            needs_human: pattern.needs_human,
            diagnosis: pattern.diagnosis.to_string(),
        })
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    failure_class: String,
    #[serde(default)]
    retryable: bool,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    needs_human: bool,
    #[serde(default)]
    diagnosis: String,
}

/// Coerce a model reply into a [`Classification`].
///
/// Unparseable replies and classes outside the closed enumeration become
/// `UNKNOWN` with `needs_human = true`. At most [`MAX_PROPOSED_ACTIONS`] actions
/// are kept; their names are validated later, at execution.
pub fn coerce_model_reply(reply: &str) -> Classification {
    let Some(json) = extract_json_object(reply) else {
        warn!("classifier reply carried no JSON object");
        return Classification::unknown("classifier reply was not parseable");
    };
    let raw: RawClassification = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(err = %err, "classifier reply did not match schema");
            return Classification::unknown("classifier reply was not parseable");
        }
    };
    let Some(failure_class) = FailureClass::parse(&raw.failure_class) else {
        warn!(class = %raw.failure_class, "classifier returned class outside taxonomy");
        return Classification::unknown(format!(
            "classifier returned unrecognized class '{}': {}",
            raw.failure_class, raw.diagnosis
        ));
    };
    let mut actions = raw.actions;
    actions.truncate(MAX_PROPOSED_ACTIONS);
    let needs_human = raw.needs_human || failure_class == FailureClass::Unknown;
    Classification {
        failure_class,
        retryable: raw.retryable && failure_class != FailureClass::Unknown,
        actions,
        needs_human,
        diagnosis: raw.diagnosis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_of(text: &str) -> Option<FailureClass> {
        classify_heuristic(text).map(|c| c.failure_class)
    }

    #[test]
    fn rate_limit_wins_over_timeout() {
        let c = classify_heuristic("exit 124: request timed out (rate limit reached)")
            .expect("classified");
        assert_eq!(c.failure_class, FailureClass::RateLimit);
        assert!(c.retryable);
        assert_eq!(c.actions, vec!["RETRY_WITH_DELAY".to_string()]);
    }

    #[test]
    fn recognizes_structural_failures() {
        assert_eq!(
            class_of("ERROR: A pull request already exists for epic/E1/T1-foo"),
            Some(FailureClass::PrExists)
        );
        assert_eq!(
            class_of("fatal: a branch named 'agent/T1-x' already exists"),
            Some(FailureClass::BranchExists)
        );
        assert_eq!(
            class_of("CONFLICT (content): Merge conflict in src/lib.rs"),
            Some(FailureClass::MergeConflict)
        );
        assert_eq!(
            class_of("<<<<<<< HEAD\nfoo\n=======\nbar\n>>>>>>> topic"),
            Some(FailureClass::MergeConflict)
        );
        assert_eq!(
            class_of("Branch epic/E1/T1-foo needs restack"),
            Some(FailureClass::GraphiteDrift)
        );
        assert_eq!(
            class_of("git@github.com: Permission denied (publickey)."),
            Some(FailureClass::AuthFailure)
        );
        assert_eq!(
            class_of("fatal: unable to access: Could not resolve host: github.com"),
            Some(FailureClass::NetworkError)
        );
    }

    #[test]
    fn unmatched_text_falls_through() {
        assert_eq!(class_of("assertion failed: left == right"), None);
    }

    #[test]
    fn coerces_out_of_taxonomy_class_to_unknown() {
        let c = coerce_model_reply(r#"{"failure_class":"DISK_FULL","retryable":true}"#);
        assert_eq!(c.failure_class, FailureClass::Unknown);
        assert!(c.needs_human);
        assert!(!c.retryable);
    }

    #[test]
    fn coerces_unparseable_reply_to_unknown() {
        let c = coerce_model_reply("I think it is a flaky test");
        assert_eq!(c.failure_class, FailureClass::Unknown);
        assert!(c.needs_human);
    }

    #[test]
    fn keeps_valid_reply_and_bounds_actions() {
        let reply = r#"Here you go:
{"failure_class":"VALIDATION_FAILURE","retryable":false,
 "actions":["GIT_STASH","BD_BLOCK","NOTIFY_HUMAN","NO_OP"],
 "needs_human":false,"diagnosis":"lint fails"}"#;
        let c = coerce_model_reply(reply);
        assert_eq!(c.failure_class, FailureClass::ValidationFailure);
        assert_eq!(c.actions.len(), MAX_PROPOSED_ACTIONS);
        assert_eq!(c.diagnosis, "lint fails");
    }

    #[test]
    fn unknown_from_model_always_needs_human() {
        let c = coerce_model_reply(r#"{"failure_class":"UNKNOWN","needs_human":false}"#);
        assert!(c.needs_human);
    }
}
