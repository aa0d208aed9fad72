//! Stacked-branch tool adapter (`gt`).
//!
//! `gt log` is textual; it is parsed here into a [`StackLog`] so drift and PR
//! discovery downstream work on typed entries.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::io::process::run_command_with_timeout;

static PR_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pull/(\d+)").expect("valid PR url regex"));
static PR_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bPR #(\d+)").expect("valid PR label regex"));

const BRANCH_GLYPHS: &[char] = &['◉', '◯', '○', '●', '◎'];

/// Result of `gt submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub pr_number: Option<u64>,
    pub output: String,
}

/// One branch in the stack as reported by `gt log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub branch: String,
    pub pr: Option<u64>,
    pub needs_restack: bool,
}

/// Parsed `gt log` output. Branches not listed are untracked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackLog {
    pub entries: Vec<StackEntry>,
}

impl StackLog {
    pub fn find(&self, branch: &str) -> Option<&StackEntry> {
        self.entries.iter().find(|e| e.branch == branch)
    }

    pub fn pr_for(&self, branch: &str) -> Option<u64> {
        self.find(branch).and_then(|e| e.pr)
    }

    pub fn parse(text: &str) -> Self {
        let mut entries: Vec<StackEntry> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim_start_matches(['│', '|', ' ', '─', '┘', '┐', '┌', '└']);
            if let Some(rest) = trimmed.strip_prefix(BRANCH_GLYPHS) {
                let Some(branch) = rest.split_whitespace().next() else {
                    continue;
                };
                entries.push(StackEntry {
                    branch: branch.to_string(),
                    pr: None,
                    needs_restack: rest.contains("needs restack"),
                });
                continue;
            }
            let Some(current) = entries.last_mut() else {
                continue;
            };
            if current.pr.is_none()
                && let Some(caps) = PR_LABEL.captures(line)
            {
                current.pr = caps[1].parse().ok();
            }
        }
        Self { entries }
    }
}

pub trait StackTool {
    /// Create `branch` stacked on `parent` (which must be checked out).
    fn create(&self, branch: &str, parent: &str, message: &str) -> Result<()>;
    /// Amend the current branch's commit with all staged changes.
    fn modify(&self, message: &str) -> Result<()>;
    /// Push and open or update a draft PR for the current stack.
    fn submit(&self) -> Result<SubmitResult>;
    fn track(&self, branch: &str, parent: Option<&str>, force: bool) -> Result<()>;
    fn restack(&self) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn log(&self) -> Result<StackLog>;
}

/// `gt` CLI in a working tree.
#[derive(Debug, Clone)]
pub struct GtCli {
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl GtCli {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("gt");
        cmd.args(args).arg("--no-interactive").current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        if !output.success() {
            return Err(anyhow!(
                "gt {} failed (exit {}): {}",
                args.join(" "),
                output.exit_code(),
                output.combined().trim()
            ));
        }
        Ok(output.combined())
    }
}

impl StackTool for GtCli {
    #[instrument(skip_all, fields(branch, parent))]
    fn create(&self, branch: &str, parent: &str, message: &str) -> Result<()> {
        debug!(branch, parent, "creating stacked branch");
        self.run(&["create", branch, "--message", message])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn modify(&self, message: &str) -> Result<()> {
        self.run(&["modify", "--all", "--message", message])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn submit(&self) -> Result<SubmitResult> {
        let output = self.run(&["submit", "--draft"])?;
        let pr_number = parse_pr_number(&output);
        info!(pr = ?pr_number, "submitted stack");
        Ok(SubmitResult { pr_number, output })
    }

    #[instrument(skip_all, fields(branch, force))]
    fn track(&self, branch: &str, parent: Option<&str>, force: bool) -> Result<()> {
        let mut args = vec!["track", branch];
        if let Some(parent) = parent {
            args.extend(["--parent", parent]);
        }
        if force {
            args.push("--force");
        }
        self.run(&args)?;
        Ok(())
    }

    fn restack(&self) -> Result<()> {
        self.run(&["restack"])?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.run(&["sync", "--force"])?;
        Ok(())
    }

    fn log(&self) -> Result<StackLog> {
        let text = self.run(&["log"])?;
        let log = StackLog::parse(&text);
        debug!(branches = log.entries.len(), "parsed stack log");
        Ok(log)
    }
}

/// PR number from submit output (`.../pull/123`), if present.
pub fn parse_pr_number(text: &str) -> Option<u64> {
    PR_URL
        .captures_iter(text)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}
