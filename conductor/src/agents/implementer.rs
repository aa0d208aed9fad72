//! Implementer agent: one task, one branch, changes left in the working tree.

use anyhow::Result;
use tracing::{info, instrument};

use crate::agents::harness::Harness;
use crate::agents::{finish_work_session, invocation_failed};
use crate::core::types::{AgentOutcome, Comment, Task};
use crate::io::git::Vcs;
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct ImplementerAgent {
    model: String,
    prompts: PromptBuilder,
}

impl ImplementerAgent {
    pub fn new(model: impl Into<String>, prompt_budget_bytes: usize) -> Self {
        Self {
            model: model.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    /// Run one implementation session.
    ///
    /// Invocation failures become [`AgentOutcome::Error`]; only working-tree
    /// errors (staging, diffing) are returned as `Err`.
    #[instrument(skip_all, fields(task = %task.id, branch))]
    pub fn run(
        &self,
        harness: &Harness<'_>,
        vcs: &dyn Vcs,
        task: &Task,
        branch: &str,
        epic: Option<&Task>,
        answers: &[Comment],
    ) -> Result<AgentOutcome> {
        let prompt = self.prompts.implement(task, branch, epic, answers)?;
        let response = match harness.invoke(&self.model, &prompt) {
            Ok(response) => response,
            Err(err) => return Ok(invocation_failed(&err)),
        };
        let outcome = finish_work_session(vcs, &response.output)?;
        info!(outcome = outcome_label(&outcome), "implementer finished");
        Ok(outcome)
    }
}

pub(crate) fn outcome_label(outcome: &AgentOutcome) -> &'static str {
    match outcome {
        AgentOutcome::Success { .. } => "success",
        AgentOutcome::Blocked { .. } => "blocked",
        AgentOutcome::Error(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::backoff::Backoff;
    use crate::core::types::AgentErrorKind;
    use crate::test_support::{FakeVcs, RecordingSleeper, ScriptedModel, fail, reply, task};

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(4))
    }

    #[test]
    fn success_carries_staged_diff_and_prompt_has_answers() {
        let model = ScriptedModel::new()
            .script("opus", vec![reply(r#"{"status":"done","summary":"added flag"}"#)])
            .with_edit("opus", "+--verbose");
        let vcs = FakeVcs::new("agent/T1-x");
        model.attach_vcs(&vcs);
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(&model, &sleeper, backoff(), 0);
        let answers = vec![Comment {
            author: "sam".to_string(),
            text: "Use clap".to_string(),
        }];

        let outcome = ImplementerAgent::new("opus", 10_000)
            .run(&harness, &vcs, &task("T1"), "agent/T1-x", None, &answers)
            .expect("run");
        let AgentOutcome::Success { diff, summary } = outcome else {
            panic!("expected success");
        };
        assert_eq!(diff, "+--verbose");
        assert_eq!(summary, "added flag");
        assert!(model.last_prompt("opus").expect("prompt").contains("sam: Use clap"));
    }

    #[test]
    fn invocation_failure_is_typed_error() {
        let model = ScriptedModel::new().script("opus", vec![fail(1, "auth: invalid api key")]);
        let vcs = FakeVcs::new("agent/T1-x");
        let sleeper = RecordingSleeper::default();
        let harness = Harness::new(&model, &sleeper, backoff(), 2);

        let outcome = ImplementerAgent::new("opus", 10_000)
            .run(&harness, &vcs, &task("T1"), "agent/T1-x", None, &[])
            .expect("run");
        let AgentOutcome::Error(err) = outcome else {
            panic!("expected error");
        };
        assert_eq!(err.kind, AgentErrorKind::Invocation);
        assert!(err.message.contains("invalid api key"));
    }
}
