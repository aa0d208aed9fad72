//! `conductor`: drives ready tracker tasks to merged-ready PRs.
//!
//! Each iteration picks one task, prepares a stacked branch, runs the
//! implementer, gates the result behind validation, review, and a completion
//! check, then submits and closes the task.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use conductor::core::phase::Phase;
use conductor::exit_codes;
use conductor::health::PreflightOutcome;
use conductor::io::config::{LoopConfig, resolve_config};
use conductor::io::git::Git;
use conductor::io::graphite::GtCli;
use conductor::io::lock::{LockHeldError, WorktreeLock};
use conductor::io::model::ClaudeCli;
use conductor::io::sleeper::{ShutdownFlag, ThreadSleeper};
use conductor::io::state_store::{FileStateStore, StateStore};
use conductor::io::tracker::BdCli;
use conductor::io::validation::ShellValidator;
use conductor::logging::{self, FORMAT_ENV, LogFormat};
use conductor::looping::{LoopControl, run_loop};
use conductor::pipeline::{Collaborators, IterationOutcome, Orchestrator};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Autonomous task loop over a tracker, a stacked-PR tool, and coding agents"
)]
struct Cli {
    /// Config file (TOML). Without it the per-worktree config is used if present.
    #[arg(long, global = true, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,
    /// Working tree to drive; overrides `repo_root`.
    #[arg(long, global = true)]
    repo: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run iterations until interrupted.
    Run {
        /// Stop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Run a single iteration and exit.
    Once,
    /// Validate the baseline (with one resync) and report the breaker state.
    Preflight,
    /// Classify failure text from the argument or stdin.
    Classify {
        #[arg(long, default_value = "IMPLEMENT")]
        phase: String,
        #[arg(long, default_value = "-")]
        task: String,
        text: Option<String>,
    },
    /// Print persisted loop state.
    State {
        /// Reset this task's failure counter first.
        #[arg(long, value_name = "TASK")]
        clear_failures: Option<String>,
    },
    /// Print the resolved configuration.
    Config,
}

fn main() {
    logging::init(LogFormat::parse(std::env::var(FORMAT_ENV).ok().as_deref()));
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let repo = cli.repo.clone();
    let config = resolve_config(cli.config.as_deref(), |name| {
        if name == "CONDUCTOR_REPO_ROOT"
            && let Some(repo) = &repo
        {
            return Some(repo.to_string_lossy().into_owned());
        }
        std::env::var(name).ok()
    })?;

    match cli.command {
        Command::Run { max_iterations } => cmd_run(&config, max_iterations),
        Command::Once => cmd_once(&config),
        Command::Preflight => cmd_preflight(&config),
        Command::Classify { phase, task, text } => cmd_classify(&config, &phase, &task, text),
        Command::State { clear_failures } => cmd_state(&config, clear_failures.as_deref()),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).context("render config")?);
            Ok(exit_codes::OK)
        }
    }
}

/// Production implementations of every collaborator.
struct Adapters {
    vcs: Git,
    stack: GtCli,
    tracker: BdCli,
    model: ClaudeCli,
    validator: ShellValidator,
    store: FileStateStore,
    sleeper: ThreadSleeper,
}

impl Adapters {
    fn new(config: &LoopConfig, shutdown: &ShutdownFlag) -> Self {
        let paths = config.state_paths();
        let root = &config.repo_root;
        Self {
            vcs: Git::new(
                root,
                &config.remote,
                config.command_timeout(),
                config.output_limit_bytes,
            ),
            stack: GtCli::new(root, config.command_timeout(), config.output_limit_bytes),
            tracker: BdCli::new(root, config.command_timeout(), config.output_limit_bytes),
            model: ClaudeCli::new(root, config.model_timeout(), config.output_limit_bytes),
            validator: ShellValidator {
                workdir: root.clone(),
                validation_command: config.validation_command.clone(),
                install_command: config.install_command.clone(),
                log_path: paths.validation_log_path.clone(),
                timeout: config.validation_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            },
            store: FileStateStore::new(&paths),
            sleeper: ThreadSleeper::new(shutdown.clone()),
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            vcs: &self.vcs,
            stack: &self.stack,
            tracker: &self.tracker,
            model: &self.model,
            validator: &self.validator,
            store: &self.store,
            sleeper: &self.sleeper,
        }
    }
}

fn install_shutdown_handler() -> Result<ShutdownFlag> {
    let shutdown = ShutdownFlag::new();
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested, finishing the current iteration");
        flag.request();
    })
    .context("install signal handler")?;
    Ok(shutdown)
}

fn cmd_run(config: &LoopConfig, max_iterations: Option<u32>) -> Result<i32> {
    let shutdown = install_shutdown_handler()?;
    let adapters = Adapters::new(config, &shutdown);
    let orchestrator = Orchestrator::new(adapters.collaborators(), config);
    let lock_path = config.state_paths().lock_path;
    let control = LoopControl {
        lock_path: &lock_path,
        sleeper: &adapters.sleeper,
        shutdown: &shutdown,
        max_iterations,
    };
    let outcome = run_loop(&orchestrator, config, &control, |result| {
        println!("{result}");
    })?;
    println!(
        "{} iteration(s): {} closed, {} blocked, {} error(s)",
        outcome.iterations, outcome.closed, outcome.blocked, outcome.errors
    );
    Ok(exit_codes::OK)
}

fn cmd_once(config: &LoopConfig) -> Result<i32> {
    let lock_path = config.state_paths().lock_path;
    let lock = match WorktreeLock::acquire(&lock_path, config.lock_ttl(), Utc::now()) {
        Ok(lock) => lock,
        Err(err) => {
            if let Some(held) = err.downcast_ref::<LockHeldError>() {
                eprintln!("{held}");
                return Ok(exit_codes::LOCKED);
            }
            return Err(err);
        }
    };
    let shutdown = ShutdownFlag::new();
    let adapters = Adapters::new(config, &shutdown);
    let outcome = Orchestrator::new(adapters.collaborators(), config).run_once()?;
    lock.release()?;
    println!("{outcome}");
    Ok(match outcome {
        IterationOutcome::Closed { .. } | IterationOutcome::Skipped { .. } => exit_codes::OK,
        IterationOutcome::Idle => exit_codes::IDLE,
        IterationOutcome::Blocked { .. }
        | IterationOutcome::Released { .. }
        | IterationOutcome::InfraFailure { .. } => exit_codes::BLOCKED,
    })
}

fn cmd_preflight(config: &LoopConfig) -> Result<i32> {
    let shutdown = ShutdownFlag::new();
    let adapters = Adapters::new(config, &shutdown);
    let outcome = Orchestrator::new(adapters.collaborators(), config).preflight()?;
    match outcome {
        PreflightOutcome::Healthy => {
            println!("baseline healthy");
            Ok(exit_codes::OK)
        }
        PreflightOutcome::Degraded { failures, tail } => {
            println!("baseline failing ({failures} in window)\n{tail}");
            Ok(exit_codes::BLOCKED)
        }
        PreflightOutcome::Pause { failures, tail } => {
            println!("baseline failing, breaker open ({failures} in window)\n{tail}");
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_classify(config: &LoopConfig, phase: &str, task: &str, text: Option<String>) -> Result<i32> {
    let phase = Phase::parse(phase).ok_or_else(|| anyhow!("unknown phase '{phase}'"))?;
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read failure text from stdin")?;
            buf
        }
    };
    let shutdown = ShutdownFlag::new();
    let adapters = Adapters::new(config, &shutdown);
    let classification =
        Orchestrator::new(adapters.collaborators(), config).classify(phase, task, &text);
    let rendered = json!({
        "failure_class": classification.failure_class.as_str(),
        "retryable": classification.retryable,
        "actions": classification.actions,
        "needs_human": classification.needs_human,
        "diagnosis": classification.diagnosis,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).context("render classification")?
    );
    Ok(exit_codes::OK)
}

fn cmd_state(config: &LoopConfig, clear_failures: Option<&str>) -> Result<i32> {
    let paths = config.state_paths();
    let store = FileStateStore::new(&paths);
    let mut state = store.load()?;
    if let Some(task_id) = clear_failures {
        if state.clear_failures(task_id) {
            store.save(&state)?;
            info!(task_id, "failure counter cleared");
        } else {
            info!(task_id, "no failures recorded");
        }
    }
    let rendered = json!({
        "state_dir": paths.dir,
        "current_task": state.current_task,
        "failure_counts": state.failure_counts,
        "health": state.health,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).context("render state")?
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_limit() {
        let cli = Cli::parse_from(["conductor", "run", "--max-iterations", "3"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(3)
            }
        ));
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from(["conductor", "once", "--repo", "/tmp/repo"]);
        assert!(matches!(cli.command, Command::Once));
        assert_eq!(cli.repo, Some(PathBuf::from("/tmp/repo")));
    }

    #[test]
    fn parse_state_clear_failures() {
        let cli = Cli::parse_from(["conductor", "state", "--clear-failures", "T7"]);
        let Command::State { clear_failures } = cli.command else {
            panic!("expected state");
        };
        assert_eq!(clear_failures.as_deref(), Some("T7"));
    }

    #[test]
    fn parse_classify_defaults() {
        let cli = Cli::parse_from(["conductor", "classify", "rate limit exceeded"]);
        let Command::Classify { phase, task, text } = cli.command else {
            panic!("expected classify");
        };
        assert_eq!(phase, "IMPLEMENT");
        assert_eq!(task, "-");
        assert_eq!(text.as_deref(), Some("rate limit exceeded"));
    }
}
