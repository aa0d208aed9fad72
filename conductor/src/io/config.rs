//! Loop configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `CONDUCTOR_*` environment variables. The result is validated once.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backoff::Backoff;
use crate::core::epic::DEFAULT_EPIC_DEPTH;
use crate::io::model::ModelMap;
use crate::io::paths::{StatePaths, default_state_root};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "CONDUCTOR_";

/// Loop configuration (TOML + environment).
///
/// Missing fields take the defaults below, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Working tree the loop drives.
    pub repo_root: PathBuf,
    /// Root for per-worktree state; defaults to `<tmp>/conductor`.
    pub state_dir: Option<PathBuf>,
    pub base_branch: String,
    pub remote: String,

    /// Shell command whose exit code is the sole validation signal.
    pub validation_command: String,
    /// Dependency install command run during environment resync.
    pub install_command: Option<String>,
    /// Long-running preview server started for the review phase.
    pub preview_command: Option<String>,
    /// URL the preview server answers on; handed to the reviewer.
    pub preview_url: Option<String>,

    pub models: ModelMap,

    pub model_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    /// Timeout for `git`/`gt`/`bd` calls that go through the process runner.
    pub command_timeout_secs: u64,
    pub model_max_retries: u32,
    pub backoff_initial_secs: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_secs: u64,

    pub min_confidence: f64,
    /// `0.0` disables the coverage gate.
    pub min_coverage: f64,
    pub max_repair_attempts: u32,
    /// A task whose failure count exceeds this is blocked on pickup.
    pub max_task_failures: u32,
    pub max_infra_failures: u32,
    pub infra_window_secs: u64,

    pub pause_secs: u64,
    pub idle_secs: u64,
    pub lock_ttl_secs: u64,
    pub lock_retry_secs: u64,
    pub retry_delay_secs: u64,
    pub max_step_retries: u32,
    pub epic_depth: usize,

    pub reviewer_enabled: bool,
    pub checker_enabled: bool,

    pub output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            state_dir: None,
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            validation_command: "just ci".to_string(),
            install_command: None,
            preview_command: None,
            preview_url: None,
            models: ModelMap::default(),
            model_timeout_secs: 30 * 60,
            validation_timeout_secs: 30 * 60,
            command_timeout_secs: 10 * 60,
            model_max_retries: 3,
            backoff_initial_secs: 5,
            backoff_multiplier: 2.0,
            backoff_max_secs: 5 * 60,
            min_confidence: 0.8,
            min_coverage: 0.0,
            max_repair_attempts: 1,
            max_task_failures: 2,
            max_infra_failures: 3,
            infra_window_secs: 60 * 60,
            pause_secs: 30 * 60,
            idle_secs: 60,
            lock_ttl_secs: 60 * 60,
            lock_retry_secs: 60,
            retry_delay_secs: 30,
            max_step_retries: 2,
            epic_depth: DEFAULT_EPIC_DEPTH,
            reviewer_enabled: true,
            checker_enabled: true,
            output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 200_000,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("model_timeout_secs", self.model_timeout_secs),
            ("validation_timeout_secs", self.validation_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("backoff_initial_secs", self.backoff_initial_secs),
            ("infra_window_secs", self.infra_window_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                bail!("{name} must be > 0");
            }
        }
        if self.backoff_max_secs < self.backoff_initial_secs {
            bail!("backoff_max_secs must be >= backoff_initial_secs");
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            bail!("backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!("min_confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.min_coverage) {
            bail!("min_coverage must be within [0, 1]");
        }
        if self.max_infra_failures == 0 {
            bail!("max_infra_failures must be > 0");
        }
        if self.validation_command.trim().is_empty() {
            bail!("validation_command must not be empty");
        }
        if self.base_branch.trim().is_empty() || self.remote.trim().is_empty() {
            bail!("base_branch and remote must not be empty");
        }
        for (role, id) in [
            ("implementer", &self.models.implementer),
            ("reviewer", &self.models.reviewer),
            ("checker", &self.models.checker),
            ("classifier", &self.models.classifier),
        ] {
            if id.trim().is_empty() {
                bail!("models.{role} must not be empty");
            }
        }
        if self.epic_depth == 0 {
            bail!("epic_depth must be > 0");
        }
        if self.output_limit_bytes == 0 || self.prompt_budget_bytes == 0 {
            bail!("output_limit_bytes and prompt_budget_bytes must be > 0");
        }
        Ok(())
    }

    /// Apply `CONDUCTOR_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("REPO_ROOT") {
            self.repo_root = PathBuf::from(v);
        }
        if let Some(v) = get("STATE_DIR") {
            self.state_dir = Some(PathBuf::from(v));
        }
        set_string(&get, "BASE_BRANCH", &mut self.base_branch);
        set_string(&get, "REMOTE", &mut self.remote);
        set_string(&get, "VALIDATION_COMMAND", &mut self.validation_command);
        set_optional(&get, "INSTALL_COMMAND", &mut self.install_command);
        set_optional(&get, "PREVIEW_COMMAND", &mut self.preview_command);
        set_optional(&get, "PREVIEW_URL", &mut self.preview_url);
        set_string(&get, "MODEL_IMPLEMENTER", &mut self.models.implementer);
        set_string(&get, "MODEL_REVIEWER", &mut self.models.reviewer);
        set_string(&get, "MODEL_CHECKER", &mut self.models.checker);
        set_string(&get, "MODEL_CLASSIFIER", &mut self.models.classifier);

        set_parsed(&get, "MODEL_TIMEOUT_SECS", &mut self.model_timeout_secs)?;
        set_parsed(&get, "VALIDATION_TIMEOUT_SECS", &mut self.validation_timeout_secs)?;
        set_parsed(&get, "COMMAND_TIMEOUT_SECS", &mut self.command_timeout_secs)?;
        set_parsed(&get, "MODEL_MAX_RETRIES", &mut self.model_max_retries)?;
        set_parsed(&get, "BACKOFF_INITIAL_SECS", &mut self.backoff_initial_secs)?;
        set_parsed(&get, "BACKOFF_MULTIPLIER", &mut self.backoff_multiplier)?;
        set_parsed(&get, "BACKOFF_MAX_SECS", &mut self.backoff_max_secs)?;
        set_parsed(&get, "MIN_CONFIDENCE", &mut self.min_confidence)?;
        set_parsed(&get, "MIN_COVERAGE", &mut self.min_coverage)?;
        set_parsed(&get, "MAX_REPAIR_ATTEMPTS", &mut self.max_repair_attempts)?;
        set_parsed(&get, "MAX_TASK_FAILURES", &mut self.max_task_failures)?;
        set_parsed(&get, "MAX_INFRA_FAILURES", &mut self.max_infra_failures)?;
        set_parsed(&get, "INFRA_WINDOW_SECS", &mut self.infra_window_secs)?;
        set_parsed(&get, "PAUSE_SECS", &mut self.pause_secs)?;
        set_parsed(&get, "IDLE_SECS", &mut self.idle_secs)?;
        set_parsed(&get, "LOCK_TTL_SECS", &mut self.lock_ttl_secs)?;
        set_parsed(&get, "LOCK_RETRY_SECS", &mut self.lock_retry_secs)?;
        set_parsed(&get, "RETRY_DELAY_SECS", &mut self.retry_delay_secs)?;
        set_parsed(&get, "MAX_STEP_RETRIES", &mut self.max_step_retries)?;
        set_parsed(&get, "EPIC_DEPTH", &mut self.epic_depth)?;
        set_parsed(&get, "OUTPUT_LIMIT_BYTES", &mut self.output_limit_bytes)?;
        set_parsed(&get, "PROMPT_BUDGET_BYTES", &mut self.prompt_budget_bytes)?;
        set_bool(&get, "REVIEWER_ENABLED", &mut self.reviewer_enabled)?;
        set_bool(&get, "CHECKER_ENABLED", &mut self.checker_enabled)?;
        Ok(())
    }

    pub fn state_paths(&self) -> StatePaths {
        let root = self.state_dir.clone().unwrap_or_else(default_state_root);
        StatePaths::new(&root, &self.repo_root)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_initial_secs),
            self.backoff_multiplier,
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn infra_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.infra_window_secs).unwrap_or(i64::MAX))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lock_ttl_secs).unwrap_or(i64::MAX))
    }
}

fn set_string(get: &impl Fn(&str) -> Option<String>, name: &str, field: &mut String) {
    if let Some(value) = get(name) {
        *field = value;
    }
}

fn set_optional(get: &impl Fn(&str) -> Option<String>, name: &str, field: &mut Option<String>) {
    if let Some(value) = get(name) {
        *field = Some(value);
    }
}

fn set_parsed<T>(get: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = get(name) {
        *field = value
            .trim()
            .parse()
            .map_err(|err| anyhow!("{ENV_PREFIX}{name}='{value}': {err}"))?;
    }
    Ok(())
}

fn set_bool(get: &impl Fn(&str) -> Option<String>, name: &str, field: &mut bool) -> Result<()> {
    if let Some(value) = get(name) {
        *field = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => bail!("{ENV_PREFIX}{name}='{other}': expected a boolean"),
        };
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(LoopConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Full resolution: explicit file (must exist) or defaults, then environment, then validation.
pub fn resolve_config<F>(explicit: Option<&Path>, lookup: F) -> Result<LoopConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            load_config(path)?
        }
        None => LoopConfig::default(),
    };
    cfg.apply_env(&lookup)?;
    if explicit.is_none() {
        // The per-worktree config file is only known once repo_root/state_dir are.
        let implicit = cfg.state_paths().config_path;
        if implicit.exists() {
            cfg = load_config(&implicit)?;
            cfg.apply_env(&lookup)?;
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = LoopConfig::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.max_repair_attempts, 1);
        assert_eq!(cfg.max_task_failures, 2);
        assert_eq!(cfg.epic_depth, 6);
        assert!((cfg.min_confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "base_branch = \"trunk\"\n[models]\nimplementer = \"opus-large\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.base_branch, "trunk");
        assert_eq!(cfg.models.implementer, "opus-large");
        assert_eq!(cfg.models.reviewer, "sonnet");
        assert_eq!(cfg.remote, "origin");
    }

    #[test]
    fn env_overrides_file_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_repair_attempts = 3\n").expect("write");
        let cfg = resolve_config(
            Some(&path),
            env(&[
                ("CONDUCTOR_MAX_REPAIR_ATTEMPTS", "2"),
                ("CONDUCTOR_REVIEWER_ENABLED", "off"),
                ("CONDUCTOR_MIN_COVERAGE", "0.6"),
                ("CONDUCTOR_MODEL_CHECKER", "haiku"),
            ]),
        )
        .expect("resolve");
        assert_eq!(cfg.max_repair_attempts, 2);
        assert!(!cfg.reviewer_enabled);
        assert!((cfg.min_coverage - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.models.checker, "haiku");
    }

    #[test]
    fn rejects_bad_values() {
        let err = resolve_config(None, env(&[("CONDUCTOR_MIN_CONFIDENCE", "1.5")])).unwrap_err();
        assert!(err.to_string().contains("min_confidence"));

        let err = resolve_config(None, env(&[("CONDUCTOR_IDLE_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("CONDUCTOR_IDLE_SECS"));

        let err =
            resolve_config(None, env(&[("CONDUCTOR_CHECKER_ENABLED", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resolve_config(Some(&temp.path().join("nope.toml")), env(&[])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn picks_up_per_worktree_config_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state_dir = temp.path().join("state");
        let repo = temp.path().join("repo");
        let paths = StatePaths::new(&state_dir, &repo);
        fs::create_dir_all(&paths.dir).expect("mkdir");
        fs::write(&paths.config_path, "idle_secs = 5\n").expect("write");

        let state = state_dir.to_string_lossy().to_string();
        let repo = repo.to_string_lossy().to_string();
        let cfg = resolve_config(
            None,
            env(&[
                ("CONDUCTOR_STATE_DIR", state.as_str()),
                ("CONDUCTOR_REPO_ROOT", repo.as_str()),
            ]),
        )
        .expect("resolve");
        assert_eq!(cfg.idle_secs, 5);
    }
}
