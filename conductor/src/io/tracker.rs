//! Issue-tracker adapter (`bd`).
//!
//! `bd --json` output is loosely shaped: dependencies may be plain ids or
//! objects, and `show` may return an object or a one-element array. All of
//! that is normalized here into [`Task`] and [`Comment`].

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{Comment, Task, TaskStatus, TaskUpdate};
use crate::io::process::run_command_with_timeout;

pub trait Tracker {
    /// Dependency-satisfied tasks, in the tracker's own order.
    fn ready(&self) -> Result<Vec<Task>>;
    fn show(&self, id: &str) -> Result<Task>;
    fn update(&self, id: &str, update: &TaskUpdate) -> Result<()>;
    fn close(&self, id: &str, reason: &str) -> Result<()>;
    fn add_comment(&self, id: &str, text: &str) -> Result<()>;
    fn comments(&self, id: &str) -> Result<Vec<Comment>>;
}

/// `bd` CLI in a working tree.
#[derive(Debug, Clone)]
pub struct BdCli {
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl BdCli {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("bd");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        if !output.success() {
            return Err(anyhow!(
                "bd {} failed (exit {}): {}",
                args.join(" "),
                output.exit_code(),
                output.combined().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn run_json(&self, args: &[&str]) -> Result<Value> {
        let mut full = args.to_vec();
        full.push("--json");
        let out = self.run(&full)?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&out).with_context(|| format!("parse bd {} output", args.join(" ")))
    }
}

impl Tracker for BdCli {
    #[instrument(skip_all)]
    fn ready(&self) -> Result<Vec<Task>> {
        let tasks = parse_tasks(self.run_json(&["ready"])?)?;
        debug!(count = tasks.len(), "ready tasks");
        Ok(tasks)
    }

    #[instrument(skip_all, fields(id))]
    fn show(&self, id: &str) -> Result<Task> {
        parse_tasks(self.run_json(&["show", id])?)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("bd show {id} returned no task"))
    }

    #[instrument(skip_all, fields(id))]
    fn update(&self, id: &str, update: &TaskUpdate) -> Result<()> {
        let mut args = vec!["update", id];
        if let Some(status) = update.status {
            args.extend(["--status", status.as_str()]);
        }
        if let Some(notes) = &update.notes {
            args.extend(["--notes", notes.as_str()]);
        }
        if let Some(external_ref) = &update.external_ref {
            args.extend(["--external-ref", external_ref.as_str()]);
        }
        debug!(status = ?update.status, "updating task");
        self.run(&args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id))]
    fn close(&self, id: &str, reason: &str) -> Result<()> {
        self.run(&["close", id, "--reason", reason])?;
        Ok(())
    }

    fn add_comment(&self, id: &str, text: &str) -> Result<()> {
        self.run(&["comments", "add", id, text])?;
        Ok(())
    }

    fn comments(&self, id: &str) -> Result<Vec<Comment>> {
        let value = self.run_json(&["comments", id])?;
        let raw: Vec<RawComment> = match value {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other).context("parse bd comments")?,
        };
        Ok(raw
            .into_iter()
            .map(|c| Comment {
                author: c.author,
                text: c.text,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    author: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    issue_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    acceptance_criteria: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    external_ref: Option<String>,
    #[serde(default)]
    dependencies: Value,
}

/// Normalize `bd` JSON (object or array of objects) into tasks.
pub fn parse_tasks(value: Value) -> Result<Vec<Task>> {
    let items = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => return Err(anyhow!("unexpected bd output: {other}")),
    };
    items
        .into_iter()
        .map(|item| {
            let raw: RawIssue = serde_json::from_value(item).context("parse bd issue")?;
            Ok(raw.into_task())
        })
        .collect()
}

impl RawIssue {
    fn into_task(self) -> Task {
        let dependencies = parse_dependencies(&self.id, &self.dependencies);
        let mut description = self.description;
        if !self.acceptance_criteria.trim().is_empty() {
            if !description.is_empty() {
                description.push_str("\n\n");
            }
            description.push_str("Acceptance criteria:\n");
            description.push_str(self.acceptance_criteria.trim());
        }
        Task {
            status: TaskStatus::parse(&self.status),
            id: self.id,
            title: self.title,
            issue_type: if self.issue_type.is_empty() {
                "task".to_string()
            } else {
                self.issue_type
            },
            description,
            dependencies,
            external_ref: self.external_ref.filter(|r| !r.trim().is_empty()),
            notes: self.notes,
        }
    }
}

/// Dependency ids from either `["id", ...]` or `[{"depends_on_id": "id"}, ...]`.
/// Anything malformed yields no dependencies rather than an error.
fn parse_dependencies(owner: &str, value: &Value) -> Vec<String> {
    let Value::Array(items) = value else {
        if !value.is_null() {
            warn!(task = owner, "ignoring malformed dependency list");
        }
        return Vec::new();
    };
    let mut deps = Vec::new();
    for item in items {
        let id = match item {
            Value::String(id) => Some(id.as_str()),
            Value::Object(map) => ["depends_on_id", "id", "issue_id"]
                .iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_str))
                .find(|id| *id != owner),
            _ => None,
        };
        match id {
            Some(id) if !id.trim().is_empty() => deps.push(id.trim().to_string()),
            _ => warn!(task = owner, "ignoring malformed dependency entry"),
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_ready_list_with_object_dependencies() {
        let value = json!([{
            "id": "T1",
            "title": "Add foo",
            "status": "open",
            "issue_type": "task",
            "description": "do it",
            "acceptance_criteria": "foo works",
            "dependencies": [
                {"issue_id": "T1", "depends_on_id": "E1", "type": "parent-child"},
                "T0"
            ]
        }]);
        let tasks = parse_tasks(value).expect("tasks");
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.dependencies, vec!["E1".to_string(), "T0".to_string()]);
        assert!(t.description.contains("Acceptance criteria:\nfoo works"));
        assert_eq!(t.external_ref, None);
    }

    #[test]
    fn show_accepts_single_object() {
        let value = json!({"id": "E1", "issue_type": "epic", "status": "in_progress"});
        let tasks = parse_tasks(value).expect("tasks");
        assert!(tasks[0].is_epic());
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn malformed_dependencies_are_empty_not_errors() {
        let value = json!([
            {"id": "T1", "dependencies": "E1, T0"},
            {"id": "T2", "dependencies": [42, {"type": "blocks"}]}
        ]);
        let tasks = parse_tasks(value).expect("tasks");
        assert!(tasks[0].dependencies.is_empty());
        assert!(tasks[1].dependencies.is_empty());
    }

    #[test]
    fn empty_output_is_no_tasks() {
        assert!(parse_tasks(Value::Null).expect("tasks").is_empty());
    }
}
