//! Baseline validation with one resync attempt and an infra-failure breaker.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use crate::core::health::BreakerState;
use crate::core::types::ValidationReport;
use crate::io::git::Vcs;
use crate::io::state_store::OrchestratorState;
use crate::io::validation::Validator;

/// Result of a preflight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightOutcome {
    Healthy,
    /// Baseline is broken; release the task and carry on.
    Degraded { failures: usize, tail: String },
    /// Breaker open; the loop should back off for the pause interval.
    Pause { failures: usize, tail: String },
}

pub struct HealthMonitor<'a> {
    validator: &'a dyn Validator,
    vcs: &'a dyn Vcs,
    base_branch: &'a str,
    window: Duration,
    ceiling: usize,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(
        validator: &'a dyn Validator,
        vcs: &'a dyn Vcs,
        base_branch: &'a str,
        window: Duration,
        ceiling: usize,
    ) -> Self {
        Self {
            validator,
            vcs,
            base_branch,
            window,
            ceiling,
        }
    }

    /// Infra failures recorded within the window.
    pub fn failure_count(&self, state: &OrchestratorState, now: DateTime<Utc>) -> usize {
        state.health.failure_count(now, self.window)
    }

    /// Validate; on failure resync once and re-validate.
    ///
    /// Any pass clears the whole log. A final failure is recorded, and the
    /// breaker decides between degraded and pause. The caller persists `state`.
    #[instrument(skip_all)]
    pub fn preflight_check(
        &self,
        state: &mut OrchestratorState,
        now: DateTime<Utc>,
    ) -> Result<PreflightOutcome> {
        let first = self.validator.validate()?;
        if first.passed {
            return Ok(self.healthy(state));
        }
        warn!(exit_code = ?first.exit_code, "baseline validation failed, resyncing");
        self.resync();

        let second = self.validator.validate()?;
        if second.passed {
            info!("baseline recovered after resync");
            return Ok(self.healthy(state));
        }
        Ok(self.record_failure(state, now, &second))
    }

    fn healthy(&self, state: &mut OrchestratorState) -> PreflightOutcome {
        if !state.health.records.is_empty() {
            info!(cleared = state.health.records.len(), "infra failure log cleared");
        }
        state.health.clear();
        PreflightOutcome::Healthy
    }

    fn resync(&self) {
        if let Err(err) = self.vcs.fetch(Some(self.base_branch)) {
            warn!(err = %err, "resync fetch failed");
        }
        match self.validator.reinstall() {
            Ok(report) if !report.passed => {
                warn!(exit_code = ?report.exit_code, "dependency reinstall failed");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %err, "dependency reinstall could not run"),
        }
    }

    fn record_failure(
        &self,
        state: &mut OrchestratorState,
        now: DateTime<Utc>,
        report: &ValidationReport,
    ) -> PreflightOutcome {
        let reason = format!(
            "baseline validation failed (exit {})",
            report.exit_code.map_or("none".to_string(), |c| c.to_string())
        );
        state.health.prune(now, self.window);
        state.health.record(now, reason);
        match state.health.breaker(now, self.window, self.ceiling) {
            BreakerState::Open { failures } => {
                warn!(failures, ceiling = self.ceiling, "infra breaker open, pausing");
                PreflightOutcome::Pause {
                    failures,
                    tail: report.tail.clone(),
                }
            }
            BreakerState::Closed { failures } => {
                warn!(failures, ceiling = self.ceiling, "infra failure recorded");
                PreflightOutcome::Degraded {
                    failures,
                    tail: report.tail.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeValidator, FakeVcs};

    fn monitor<'a>(validator: &'a FakeValidator, vcs: &'a FakeVcs) -> HealthMonitor<'a> {
        HealthMonitor::new(validator, vcs, "main", Duration::hours(1), 3)
    }

    #[test]
    fn resync_recovers_a_flaky_baseline() {
        let validator = FakeValidator::script(vec![false, true]);
        let vcs = FakeVcs::new("main");
        let mut state = OrchestratorState::default();

        let outcome = monitor(&validator, &vcs)
            .preflight_check(&mut state, Utc::now())
            .expect("preflight");
        assert_eq!(outcome, PreflightOutcome::Healthy);
        assert_eq!(validator.reinstalls(), 1);
        assert!(vcs.calls().contains(&"fetch main".to_string()));
        assert!(state.health.records.is_empty());
    }

    #[test]
    fn breaker_opens_at_ceiling_and_resets_on_success() {
        let validator = FakeValidator::script(vec![false, false, false, false, false, false, true]);
        let vcs = FakeVcs::new("main");
        let monitor = monitor(&validator, &vcs);
        let mut state = OrchestratorState::default();
        let now = Utc::now();

        let first = monitor.preflight_check(&mut state, now).expect("preflight");
        assert!(matches!(first, PreflightOutcome::Degraded { failures: 1, .. }));
        monitor.preflight_check(&mut state, now).expect("preflight");
        let third = monitor.preflight_check(&mut state, now).expect("preflight");
        assert!(matches!(third, PreflightOutcome::Pause { failures: 3, .. }));
        assert_eq!(monitor.failure_count(&state, now), 3);

        let healthy = monitor.preflight_check(&mut state, now).expect("preflight");
        assert_eq!(healthy, PreflightOutcome::Healthy);
        assert_eq!(monitor.failure_count(&state, now), 0);
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let validator = FakeValidator::failing();
        let vcs = FakeVcs::new("main");
        let monitor = monitor(&validator, &vcs);
        let mut state = OrchestratorState::default();
        let start = Utc::now();

        monitor.preflight_check(&mut state, start).expect("preflight");
        monitor.preflight_check(&mut state, start).expect("preflight");
        let later = start + Duration::minutes(90);
        let outcome = monitor.preflight_check(&mut state, later).expect("preflight");
        assert!(matches!(outcome, PreflightOutcome::Degraded { failures: 1, .. }));
        assert_eq!(state.health.records.len(), 1);
    }
}
