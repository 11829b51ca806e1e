//! System-health predicate consulted before activating a cascade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Thresholds that pause intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Cascades allowed to run at once
    pub max_active_cascades: usize,

    /// Failure rate above which intake pauses
    pub failure_rate_ceiling: f64,

    /// Result reports needed before the failure rate is trusted
    pub min_sample_for_failure_rate: u64,

    /// Open breakers tolerated before intake pauses
    pub max_open_breakers_before_pause: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_active_cascades: 10,
            failure_rate_ceiling: 0.20,
            min_sample_for_failure_rate: 10,
            max_open_breakers_before_pause: 3,
        }
    }
}

/// Live signals read from the governor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSignals {
    pub active_cascades: usize,
    pub successes: u64,
    pub failures: u64,
    pub open_breakers: usize,
}

/// Which signal tripped.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseReason {
    ActiveCeiling { active: usize, ceiling: usize },
    FailureRate { rate: f64, sample: u64 },
    OpenBreakers { open: usize, ceiling: usize },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActiveCeiling { active, ceiling } => {
                write!(f, "{} active cascades (ceiling {})", active, ceiling)
            }
            Self::FailureRate { rate, sample } => {
                write!(f, "failure rate {:.1}% over {} results", rate * 100.0, sample)
            }
            Self::OpenBreakers { open, ceiling } => {
                write!(f, "{} open circuit breakers (tolerated {})", open, ceiling)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthVerdict {
    Healthy,
    Pause(PauseReason),
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl HealthPolicy {
    /// Decide whether another cascade may be activated.
    ///
    /// Activation is refused once the active count has reached the
    /// ceiling, so the ceiling is never exceeded. Success and failure
    /// counts are lifetime totals: a failure-rate pause holds until reported
    /// successes bring the rate back under the ceiling.
    pub fn assess(&self, signals: &HealthSignals) -> HealthVerdict {
        if signals.active_cascades >= self.max_active_cascades {
            return HealthVerdict::Pause(PauseReason::ActiveCeiling {
                active: signals.active_cascades,
                ceiling: self.max_active_cascades,
            });
        }

        let sample = signals.successes + signals.failures;
        if sample >= self.min_sample_for_failure_rate && sample > 0 {
            let rate = signals.failures as f64 / sample as f64;
            if rate > self.failure_rate_ceiling {
                return HealthVerdict::Pause(PauseReason::FailureRate { rate, sample });
            }
        }

        if signals.open_breakers > self.max_open_breakers_before_pause {
            return HealthVerdict::Pause(PauseReason::OpenBreakers {
                open: signals.open_breakers,
                ceiling: self.max_open_breakers_before_pause,
            });
        }

        HealthVerdict::Healthy
    }
}
