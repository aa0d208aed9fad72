//! Repair agent: a targeted follow-up session restricted to reported gaps.

use anyhow::Result;
use tracing::{info, instrument};

use crate::agents::harness::Harness;
use crate::agents::implementer::outcome_label;
use crate::agents::{finish_work_session, invocation_failed};
use crate::core::types::{AgentOutcome, Task};
use crate::io::git::Vcs;
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct RepairAgent {
    model: String,
    prompts: PromptBuilder,
}

impl RepairAgent {
    pub fn new(model: impl Into<String>, prompt_budget_bytes: usize) -> Self {
        Self {
            model: model.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    #[instrument(skip_all, fields(task = %task.id, gaps = gaps.len()))]
    pub fn run(
        &self,
        harness: &Harness<'_>,
        vcs: &dyn Vcs,
        task: &Task,
        branch: &str,
        gaps: &[String],
        validation_tail: Option<&str>,
    ) -> Result<AgentOutcome> {
        let prompt = self.prompts.repair(task, branch, gaps, validation_tail)?;
        let response = match harness.invoke(&self.model, &prompt) {
            Ok(response) => response,
            Err(err) => return Ok(invocation_failed(&err)),
        };
        let outcome = finish_work_session(vcs, &response.output)?;
        info!(outcome = outcome_label(&outcome), "repair finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::backoff::Backoff;
    use crate::test_support::{FakeVcs, RecordingSleeper, ScriptedModel, reply, task};

    #[test]
    fn prompt_is_restricted_to_gaps() {
        let model = ScriptedModel::new()
            .script("opus", vec![reply(r#"{"status":"done","summary":"tests"}"#)])
            .with_edit("opus", "+#[test]");
        let vcs = FakeVcs::new("agent/T1-x");
        model.attach_vcs(&vcs);
        let sleeper = RecordingSleeper::default();
        let backoff = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(1));
        let harness = Harness::new(&model, &sleeper, backoff, 0);

        let gaps = vec!["no test for empty input".to_string()];
        let outcome = RepairAgent::new("opus", 10_000)
            .run(&harness, &vcs, &task("T1"), "agent/T1-x", &gaps, Some("1 failed"))
            .expect("run");
        assert!(matches!(outcome, AgentOutcome::Success { .. }));
        let prompt = model.last_prompt("opus").expect("prompt");
        assert!(prompt.contains("- no test for empty input"));
        assert!(prompt.contains("1 failed"));
    }
}
