//! Validation command adapter.
//!
//! The validation command is opaque: its exit code is the only success signal
//! and the tail of its output is surfaced verbatim in blocked-task notes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ValidationReport;
use crate::io::process::{run_command_with_timeout, tail_lines};

/// Lines of output kept in a [`ValidationReport`].
pub const TAIL_LINES: usize = 40;

pub trait Validator {
    /// Run the validation command against the working tree.
    fn validate(&self) -> Result<ValidationReport>;
    /// Reinstall dependencies (part of an environment resync).
    fn reinstall(&self) -> Result<ValidationReport>;
}

/// Runs configured commands through `sh -c` in the working tree.
#[derive(Debug, Clone)]
pub struct ShellValidator {
    pub workdir: PathBuf,
    pub validation_command: String,
    pub install_command: Option<String>,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ShellValidator {
    #[instrument(skip_all, fields(label))]
    fn run_shell(&self, label: &str, command: &str) -> Result<ValidationReport> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        debug!(command, "running shell command");
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {label} command"))?;
        let mut text = output.combined();
        if output.timed_out {
            text.push_str(&format!(
                "\n{label} timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        write_log(&self.log_path, label, &text)?;
        let passed = output.success();
        if passed {
            info!(label, "command passed");
        } else {
            warn!(label, exit_code = output.exit_code(), "command failed");
        }
        Ok(ValidationReport {
            passed,
            exit_code: Some(output.exit_code()),
            tail: tail_lines(&text, TAIL_LINES),
        })
    }
}

impl Validator for ShellValidator {
    fn validate(&self) -> Result<ValidationReport> {
        self.run_shell("validation", &self.validation_command)
    }

    fn reinstall(&self) -> Result<ValidationReport> {
        match &self.install_command {
            Some(command) => self.run_shell("install", command),
            None => Ok(ValidationReport {
                passed: true,
                exit_code: None,
                tail: String::new(),
            }),
        }
    }
}

fn write_log(path: &Path, label: &str, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let buf = format!("=== {label} ===\n{text}\n");
    fs::write(path, buf).with_context(|| format!("write log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(dir: &Path, command: &str) -> ShellValidator {
        ShellValidator {
            workdir: dir.to_path_buf(),
            validation_command: command.to_string(),
            install_command: None,
            log_path: dir.join("logs").join("validation.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn passing_command_reports_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = validator(temp.path(), "echo ok").validate().expect("validate");
        assert!(report.passed);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.tail, "ok");
    }

    #[test]
    fn failing_command_surfaces_tail_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(temp.path(), "echo 'lint: unused import' >&2; exit 2");
        let report = v.validate().expect("validate");
        assert!(!report.passed);
        assert_eq!(report.exit_code, Some(2));
        assert!(report.tail.contains("unused import"));
        let log = fs::read_to_string(&v.log_path).expect("log");
        assert!(log.starts_with("=== validation ==="));
    }

    #[test]
    fn reinstall_without_command_is_noop_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = validator(temp.path(), "true").reinstall().expect("install");
        assert!(report.passed);
        assert_eq!(report.exit_code, None);
    }
}
