//! Model-based failure classifier (the fallback tier).

use tracing::{info, warn};

use crate::agents::harness::Harness;
use crate::core::classifier::coerce_model_reply;
use crate::core::types::Classification;
use crate::io::prompt::PromptBuilder;
use crate::remediation::{Classifier, FailureContext};

/// Asks a model to diagnose error text the heuristics did not recognize.
///
/// The reply is always coerced into the closed taxonomy; the proposed actions
/// are validated later, at execution, like any other tier's.
pub struct ModelClassifier<'a> {
    harness: &'a Harness<'a>,
    model: String,
    prompts: PromptBuilder,
}

impl<'a> ModelClassifier<'a> {
    pub fn new(harness: &'a Harness<'a>, model: impl Into<String>, prompt_budget_bytes: usize) -> Self {
        Self {
            harness,
            model: model.into(),
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }
}

impl Classifier for ModelClassifier<'_> {
    fn name(&self) -> &'static str {
        "model"
    }

    fn classify(&self, ctx: &FailureContext<'_>) -> Option<Classification> {
        let prompt = match self
            .prompts
            .classify(ctx.error_text, ctx.phase.as_str(), ctx.task_id)
        {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "failed to render classifier prompt");
                return None;
            }
        };
        match self.harness.invoke(&self.model, &prompt) {
            Ok(response) => {
                let classification = coerce_model_reply(&response.output);
                info!(
                    class = %classification.failure_class,
                    retryable = classification.retryable,
                    "model classified failure"
                );
                Some(classification)
            }
            Err(err) => {
                warn!(err = %err, "classifier invocation failed");
                None
            }
        }
    }
}
