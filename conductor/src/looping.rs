//! Multi-iteration loop for `conductor run`.
//!
//! Holds the worktree lock for its whole lifetime, refreshing it every
//! iteration, and sleeps between iterations according to the outcome.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::io::config::LoopConfig;
use crate::io::lock::{LockHeldError, WorktreeLock};
use crate::io::sleeper::{ShutdownFlag, Sleeper};
use crate::pipeline::{IterationOutcome, Orchestrator};

/// Inputs that control how long the loop runs.
pub struct LoopControl<'a> {
    pub lock_path: &'a Path,
    pub sleeper: &'a dyn Sleeper,
    pub shutdown: &'a ShutdownFlag,
    /// Stop after this many iterations; `None` runs until shutdown.
    pub max_iterations: Option<u32>,
}

/// Why `run_loop` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    Shutdown,
    MaxIterations,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub closed: u32,
    pub blocked: u32,
    pub errors: u32,
    pub stop: LoopStop,
}

/// Run iterations until shutdown or the iteration limit.
///
/// Iteration errors are logged and followed by the idle sleep; only losing the
/// lock ends the loop with an error.
pub fn run_loop<F: FnMut(&IterationOutcome)>(
    orchestrator: &Orchestrator<'_>,
    config: &LoopConfig,
    control: &LoopControl<'_>,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let mut outcome = LoopOutcome {
        iterations: 0,
        closed: 0,
        blocked: 0,
        errors: 0,
        stop: LoopStop::Shutdown,
    };
    let Some(lock) = acquire_lock(config, control)? else {
        return Ok(outcome);
    };
    info!(lock = %lock.path().display(), "loop started");

    while !control.shutdown.is_requested() {
        lock.refresh(Utc::now()).context("refresh worktree lock")?;
        outcome.iterations += 1;
        let pause = match orchestrator.run_once() {
            Ok(result) => {
                on_iteration(&result);
                match &result {
                    IterationOutcome::Closed { .. } => outcome.closed += 1,
                    IterationOutcome::Blocked { .. } => outcome.blocked += 1,
                    _ => {}
                }
                delay_after(&result, config)
            }
            Err(err) => {
                outcome.errors += 1;
                error!(err = %format!("{err:#}"), "iteration failed");
                Some(Duration::from_secs(config.idle_secs))
            }
        };
        if control
            .max_iterations
            .is_some_and(|max| outcome.iterations >= max)
        {
            outcome.stop = LoopStop::MaxIterations;
            break;
        }
        if let Some(pause) = pause {
            control.sleeper.sleep(pause);
        }
    }

    if let Err(err) = orchestrator.clear_marker() {
        warn!(err = %err, "could not clear current-task marker");
    }
    lock.release().context("release worktree lock")?;
    info!(
        iterations = outcome.iterations,
        closed = outcome.closed,
        blocked = outcome.blocked,
        stop = ?outcome.stop,
        "loop stopped"
    );
    Ok(outcome)
}

/// Sleep before the next iteration, if any.
fn delay_after(outcome: &IterationOutcome, config: &LoopConfig) -> Option<Duration> {
    match outcome {
        IterationOutcome::Idle => Some(Duration::from_secs(config.idle_secs)),
        IterationOutcome::InfraFailure { paused: true, .. } => {
            warn!(pause_secs = config.pause_secs, "infra breaker open, pausing");
            Some(Duration::from_secs(config.pause_secs))
        }
        _ => None,
    }
}

/// Wait for the lock while another live loop holds it. `None` on shutdown.
fn acquire_lock(config: &LoopConfig, control: &LoopControl<'_>) -> Result<Option<WorktreeLock>> {
    loop {
        if control.shutdown.is_requested() {
            return Ok(None);
        }
        match WorktreeLock::acquire(control.lock_path, config.lock_ttl(), Utc::now()) {
            Ok(lock) => return Ok(Some(lock)),
            Err(err) => {
                let Some(held) = err.downcast_ref::<LockHeldError>() else {
                    return Err(err);
                };
                info!(holder = held.holder.pid, "worktree busy, waiting for lock");
                control
                    .sleeper
                    .sleep(Duration::from_secs(config.lock_retry_secs));
            }
        }
    }
}
