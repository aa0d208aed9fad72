//! Rolling infra-failure log and circuit-breaker arithmetic.
//!
//! The breaker is count-based within a sliding window, not streak-based: any
//! successful baseline validation clears the whole log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One recorded infra failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Append-only (until pruned or cleared) log of infra failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthLog {
    pub records: Vec<FailureRecord>,
}

/// What the loop should do after a failed baseline validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Below the ceiling: release the task and carry on.
    Closed { failures: usize },
    /// Ceiling reached: back off for an extended interval.
    Open { failures: usize },
}

impl HealthLog {
    pub fn record(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.records.push(FailureRecord {
            at,
            reason: reason.into(),
        });
    }

    /// Drop records older than `window` relative to `now`.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        self.records.retain(|r| r.at > cutoff);
    }

    /// Number of failures within `window` of `now`.
    pub fn failure_count(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.records.iter().filter(|r| r.at > cutoff).count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn breaker(&self, now: DateTime<Utc>, window: Duration, ceiling: usize) -> BreakerState {
        let failures = self.failure_count(now, window);
        if failures >= ceiling {
            BreakerState::Open { failures }
        } else {
            BreakerState::Closed { failures }
        }
    }
}
