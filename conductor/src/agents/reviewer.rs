//! Reviewer agent.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::agents::harness::Harness;
use crate::core::report::parse_report;
use crate::core::types::{ReviewVerdict, Task};
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct ReviewerAgent {
    model: String,
    prompts: PromptBuilder,
}

impl ReviewerAgent {
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
        preview_url: Option<&str>,
    ) -> Result<ReviewVerdict> {
        let prompt = self.prompts.review(task, diff, preview_url)?;
        let response = harness.invoke(&self.model, &prompt)?;
        let verdict: ReviewVerdict =
            parse_report(&response.output).context("parse reviewer verdict")?;
        info!(
            approved = verdict.approved,
            comments = verdict.comments.len(),
            "review finished"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::backoff::Backoff;
    use crate::test_support::{RecordingSleeper, ScriptedModel, reply, task};

    fn harness<'a>(model: &'a ScriptedModel, sleeper: &'a RecordingSleeper) -> Harness<'a> {
        Harness::new(
            model,
            sleeper,
            Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(1)),
            0,
        )
    }

    #[test]
    fn parses_rejection_with_comments() {
        let model = ScriptedModel::new().script(
            "sonnet",
            vec![reply(
                r#"Looks risky. {"approved":false,"comments":["unwrap on user input"]}"#,
            )],
        );
        let sleeper = RecordingSleeper::default();
        let verdict = ReviewerAgent::new("sonnet", 10_000)
            .run(&harness(&model, &sleeper), &task("T1"), "+x", Some("http://localhost:3000"))
            .expect("verdict");
        assert!(!verdict.approved);
        assert_eq!(verdict.comments, vec!["unwrap on user input".to_string()]);
        assert!(
            model
                .last_prompt("sonnet")
                .expect("prompt")
                .contains("http://localhost:3000")
        );
    }

    #[test]
    fn unparseable_verdict_is_an_error() {
        let model = ScriptedModel::new().script("sonnet", vec![reply("LGTM")]);
        let sleeper = RecordingSleeper::default();
        let err = ReviewerAgent::new("sonnet", 10_000)
            .run(&harness(&model, &sleeper), &task("T1"), "+x", None)
            .unwrap_err();
        assert!(format!("{err:#}").contains("reviewer verdict"));
    }
}
