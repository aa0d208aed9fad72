//! Agent invocation harness.
//!
//! Wraps a [`ModelInvoker`] with exponential backoff for transient provider
//! failures (timeouts, rate limits, 5xx-class errors). Any other non-zero exit
//! is returned immediately as an [`InvocationError`].

use std::fmt;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::backoff::Backoff;
use crate::io::model::{ModelInvoker, ModelResponse};
use crate::io::process::{TIMEOUT_EXIT_CODE, tail_lines};
use crate::io::sleeper::Sleeper;

// 5xx codes count only next to a status/HTTP/error label, and timeouts only as
// a request or connection timing out; exit 124 covers killed invocations.
static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate[ _-]?limit|too many requests|\b429\b|overloaded|\b(?:status|http|error)(?:[ _]code)?[ :=]*5\d\d\b|internal server error|bad gateway|service unavailable|gateway time-?out|(?:request|connection|read) timed out",
    )
    .expect("valid transient regex")
});

const ERROR_TAIL_LINES: usize = 30;
/// Provider errors are reported at the end of the CLI output.
const TRANSIENT_TAIL_LINES: usize = 5;

/// A model invocation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationError {
    pub model: String,
    pub attempts: u32,
    pub exit_code: i32,
    /// True when the last failure was transient and retries ran out.
    pub transient: bool,
    pub output_tail: String,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.transient {
            "transient failure, retries exhausted"
        } else {
            "failed"
        };
        write!(
            f,
            "model {} {kind} after {} attempt(s) (exit {}): {}",
            self.model, self.attempts, self.exit_code, self.output_tail
        )
    }
}

impl std::error::Error for InvocationError {}

/// True when a failed response looks like a provider-side transient error.
pub fn is_transient(response: &ModelResponse) -> bool {
    response.exit_code == TIMEOUT_EXIT_CODE
        || TRANSIENT_RE.is_match(&tail_lines(&response.output, TRANSIENT_TAIL_LINES))
}

pub struct Harness<'a> {
    invoker: &'a dyn ModelInvoker,
    sleeper: &'a dyn Sleeper,
    backoff: Backoff,
    max_retries: u32,
}

impl<'a> Harness<'a> {
    pub fn new(
        invoker: &'a dyn ModelInvoker,
        sleeper: &'a dyn Sleeper,
        backoff: Backoff,
        max_retries: u32,
    ) -> Self {
        Self {
            invoker,
            sleeper,
            backoff,
            max_retries,
        }
    }

    /// Invoke `model_id`, retrying transient failures up to `max_retries` times.
    ///
    /// Failures surface as an [`InvocationError`] inside the `anyhow::Error`.
    #[instrument(skip_all, fields(model = model_id))]
    pub fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self.invoker.invoke(model_id, prompt)?;
            if response.success() {
                debug!(attempt, "model invocation succeeded");
                return Ok(response);
            }
            let transient = is_transient(&response);
            if !transient || attempt > self.max_retries {
                warn!(
                    attempt,
                    exit_code = response.exit_code,
                    transient,
                    "model invocation failed"
                );
                return Err(InvocationError {
                    model: model_id.to_string(),
                    attempts: attempt,
                    exit_code: response.exit_code,
                    transient,
                    output_tail: tail_lines(&response.output, ERROR_TAIL_LINES),
                }
                .into());
            }
            let delay = self.backoff.delay(attempt);
            warn!(
                attempt,
                exit_code = response.exit_code,
                delay_secs = delay.as_secs_f64(),
                "transient model failure, backing off"
            );
            self.sleeper.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{RecordingSleeper, ScriptedModel, fail, reply};

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(60))
    }

    #[test]
    fn retries_transient_failures_with_backoff() {
        let model = ScriptedModel::new().script(
            "opus",
            vec![
                fail(124, "request timed out"),
                fail(1, "Error: 529 overloaded"),
                reply("done"),
            ],
        );
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(&model, &sleeper, backoff(), 3);

        let response = harness.invoke("opus", "prompt").expect("invoke");
        assert_eq!(response.output, "done");
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
        assert_eq!(model.calls("opus"), 3);
    }

    #[test]
    fn non_transient_failure_is_not_retried() {
        let model = ScriptedModel::new().script("opus", vec![fail(2, "invalid flag --foo")]);
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(&model, &sleeper, backoff(), 3);

        let err = harness.invoke("opus", "prompt").unwrap_err();
        let invocation = err.downcast_ref::<InvocationError>().expect("typed error");
        assert_eq!(invocation.attempts, 1);
        assert!(!invocation.transient);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn gives_up_after_max_retries() {
        let model = ScriptedModel::new().script("opus", vec![fail(124, "rate limit reached")]);
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(&model, &sleeper, backoff(), 2);

        let err = harness.invoke("opus", "prompt").unwrap_err();
        let invocation = err.downcast_ref::<InvocationError>().expect("typed error");
        assert_eq!(invocation.attempts, 3);
        assert!(invocation.transient);
        assert!(invocation.to_string().contains("rate limit"));
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn provider_errors_are_transient() {
        for output in [
            "API Error: 529 overloaded",
            "HTTP 503 Service Unavailable",
            "status code: 502",
            "error: request timed out",
            "429 Too Many Requests",
        ] {
            assert!(is_transient(&fail(1, output)), "{output}");
        }
        assert!(is_transient(&fail(TIMEOUT_EXIT_CODE, "killed")));
    }

    #[test]
    fn ordinary_failures_mentioning_numbers_or_timeouts_are_not_transient() {
        for output in [
            "Error: file src/lib.rs has 512 lines, exceeds max",
            "prompt too long: 503 tokens over limit",
            "error: unknown option --timeout",
            "test integration::slow has been running for over 60 seconds; timeout",
        ] {
            assert!(!is_transient(&fail(1, output)), "{output}");
        }
    }

    #[test]
    fn only_the_end_of_the_output_is_checked() {
        let mut output = String::from("earlier tool output: rate limit of the fake API hit\n");
        for line in 0..10 {
            output.push_str(&format!("step {line} ok\n"));
        }
        output.push_str("Error: invalid configuration");
        assert!(!is_transient(&fail(1, &output)));
    }
}
