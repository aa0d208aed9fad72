//! Model invocation adapter.
//!
//! A single synchronous call: prompt in, text and exit code out. Retry policy
//! lives in [`crate::agents::harness`], not here.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Logical model roles; mapped to provider ids by [`ModelMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Implementer,
    Reviewer,
    Checker,
    Classifier,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementer => "implementer",
            Self::Reviewer => "reviewer",
            Self::Checker => "checker",
            Self::Classifier => "classifier",
        }
    }
}

/// Logical-to-provider model names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMap {
    pub implementer: String,
    pub reviewer: String,
    pub checker: String,
    pub classifier: String,
}

impl Default for ModelMap {
    fn default() -> Self {
        Self {
            implementer: "opus".to_string(),
            reviewer: "sonnet".to_string(),
            checker: "sonnet".to_string(),
            classifier: "haiku".to_string(),
        }
    }
}

impl ModelMap {
    pub fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Implementer => &self.implementer,
            ModelRole::Reviewer => &self.reviewer,
            ModelRole::Checker => &self.checker,
            ModelRole::Classifier => &self.classifier,
        }
    }
}

/// Raw result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub output: String,
    pub exit_code: i32,
}

impl ModelResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ModelInvoker {
    /// Run one prompt against `model_id`. Only spawn failures are `Err`; a
    /// non-zero exit is reported in the response.
    fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse>;
}

/// `claude -p` in print mode, prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ClaudeCli {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }
}

impl ModelInvoker for ClaudeCli {
    #[instrument(skip_all, fields(model = model_id, timeout_secs = self.timeout.as_secs()))]
    fn invoke(&self, model_id: &str, prompt: &str) -> Result<ModelResponse> {
        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg("--model")
            .arg(model_id)
            .arg("--dangerously-skip-permissions")
            .current_dir(&self.workdir);
        debug!(prompt_bytes = prompt.len(), "invoking model");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )?;
        if output.timed_out {
            warn!("model invocation timed out");
        }
        let exit_code = output.exit_code();
        debug!(exit_code, "model invocation finished");
        Ok(ModelResponse {
            output: output.combined(),
            exit_code,
        })
    }
}
