//! Checker agent: completeness verdict with confidence and optional coverage.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::agents::harness::Harness;
use crate::core::report::parse_report;
use crate::core::types::{CheckVerdict, Task};
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct CheckerAgent {
    model: String,
    prompts: PromptBuilder,
}

impl CheckerAgent {
    pub fn new(model: impl Into<String>, prompt_budget_bytes: usize) -> Self {
        Self {
            model: model.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    #[instrument(skip_all, fields(task = %task.id))]
    pub fn run(
        &self,
        harness: &Harness<'_>,
        task: &Task,
        diff: &str,
        review_comments: &[String],
    ) -> Result<CheckVerdict> {
        let prompt = self.prompts.check(task, diff, review_comments)?;
        let response = harness.invoke(&self.model, &prompt)?;
        let mut verdict: CheckVerdict =
            parse_report(&response.output).context("parse checker verdict")?;
        verdict.confidence = clamp_unit(verdict.confidence);
        verdict.coverage = verdict.coverage.map(clamp_unit);
        if !verdict.complete && verdict.gaps.is_empty() {
            verdict
                .gaps
                .push("checker reported the task incomplete without listing gaps".to_string());
        }
        info!(
            complete = verdict.complete,
            confidence = verdict.confidence,
            coverage = ?verdict.coverage,
            gaps = verdict.gaps.len(),
            "check finished"
        );
        Ok(verdict)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::backoff::Backoff;
    use crate::test_support::{RecordingSleeper, ScriptedModel, reply, task};

    fn run(reply_text: &str) -> CheckVerdict {
        let model = ScriptedModel::new().script("sonnet", vec![reply(reply_text)]);
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(
            &model,
            &sleeper,
            Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(1)),
            0,
        );
        CheckerAgent::new("sonnet", 10_000)
            .run(&harness, &task("T1"), "+x", &[])
            .expect("verdict")
    }

    #[test]
    fn passing_verdict_clears_default_thresholds() {
        let verdict = run(r#"{"complete":true,"confidence":0.85}"#);
        assert!(verdict.passes(0.8, 0.0));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let verdict = run(r#"{"complete":true,"confidence":7,"coverage":-1}"#);
        assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(verdict.coverage, Some(0.0));
        assert!(!verdict.passes(0.8, 0.5));
    }

    #[test]
    fn incomplete_without_gaps_gets_a_generic_gap() {
        let verdict = run(r#"{"complete":false,"confidence":0.9}"#);
        assert_eq!(verdict.gaps.len(), 1);
    }
}
