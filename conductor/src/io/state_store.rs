//! Persisted orchestrator state.
//!
//! The loop's durable bookkeeping is one [`OrchestratorState`] value behind a
//! [`StateStore`]. The file store keeps the line-oriented layout operators can
//! read and edit by hand:
//!
//! - `current_task`: the id of the task in flight (absent when idle)
//! - `failure_counts`: `<task-id> <count>` per line
//! - `health.log`: `<rfc3339> <reason>` per line
//!
//! Each file is replaced atomically (temp file + rename). Concurrent writers are
//! excluded by the worktree lock, not by file locking.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::health::HealthLog;
use crate::io::paths::StatePaths;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorState {
    /// Task currently being worked, so a restarted loop resumes it first.
    pub current_task: Option<String>,
    /// Consecutive terminal failures per task id.
    pub failure_counts: BTreeMap<String, u32>,
    pub health: HealthLog,
}

impl OrchestratorState {
    pub fn failures(&self, task_id: &str) -> u32 {
        self.failure_counts.get(task_id).copied().unwrap_or(0)
    }

    pub fn record_failure(&mut self, task_id: &str) -> u32 {
        let count = self.failure_counts.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_failures(&mut self, task_id: &str) -> bool {
        self.failure_counts.remove(task_id).is_some()
    }
}

pub trait StateStore {
    fn load(&self) -> Result<OrchestratorState>;
    fn save(&self, state: &OrchestratorState) -> Result<()>;
}

/// Line-oriented files under the worktree's state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    current_task_path: PathBuf,
    failure_counts_path: PathBuf,
    health_log_path: PathBuf,
}

impl FileStateStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            current_task_path: paths.current_task_path.clone(),
            failure_counts_path: paths.failure_counts_path.clone(),
            health_log_path: paths.health_log_path.clone(),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<OrchestratorState> {
        let current_task = read_optional(&self.current_task_path)?
            .map(|text| text.trim().to_string())
            .filter(|id| !id.is_empty());
        let failure_counts = read_optional(&self.failure_counts_path)?
            .map(|text| parse_failure_counts(&text))
            .unwrap_or_default();
        let health = read_optional(&self.health_log_path)?
            .map(|text| parse_health_log(&text))
            .unwrap_or_default();
        debug!(
            current_task = ?current_task,
            tracked_failures = failure_counts.len(),
            health_records = health.records.len(),
            "loaded orchestrator state"
        );
        Ok(OrchestratorState {
            current_task,
            failure_counts,
            health,
        })
    }

    fn save(&self, state: &OrchestratorState) -> Result<()> {
        match &state.current_task {
            Some(id) => write_atomic(&self.current_task_path, &format!("{id}\n"))?,
            None => remove_if_exists(&self.current_task_path)?,
        }
        write_atomic(
            &self.failure_counts_path,
            &render_failure_counts(&state.failure_counts),
        )?;
        write_atomic(&self.health_log_path, &render_health_log(&state.health))?;
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RefCell<OrchestratorState>,
}

impl MemoryStateStore {
    pub fn new(state: OrchestratorState) -> Self {
        Self {
            state: RefCell::new(state),
        }
    }

    pub fn snapshot(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<OrchestratorState> {
        Ok(self.state.borrow().clone())
    }

    fn save(&self, state: &OrchestratorState) -> Result<()> {
        *self.state.borrow_mut() = state.clone();
        Ok(())
    }
}

fn parse_failure_counts(text: &str) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|n| n.parse().ok())) {
            (Some(id), Some(count)) => {
                counts.insert(id.to_string(), count);
            }
            _ => warn!(line, "skipping malformed failure count line"),
        }
    }
    counts
}

fn render_failure_counts(counts: &BTreeMap<String, u32>) -> String {
    counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(id, count)| format!("{id} {count}\n"))
        .collect()
}

fn parse_health_log(text: &str) -> HealthLog {
    let mut log = HealthLog::default();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let (stamp, reason) = line.split_once(' ').unwrap_or((line, ""));
        match DateTime::parse_from_rfc3339(stamp) {
            Ok(at) => log.record(at.with_timezone(&Utc), reason.trim()),
            Err(_) => warn!(line, "skipping malformed health log line"),
        }
    }
    log
}

fn render_health_log(log: &HealthLog) -> String {
    log.records
        .iter()
        .map(|r| format!("{} {}\n", r.at.to_rfc3339(), r.reason.replace('\n', " ")))
        .collect()
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
