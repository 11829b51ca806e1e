//! Admission control: one permission decision per (cascade, API) call.
//!
//! The breaker check runs first and does not consume quota. Only when the
//! breaker lets the call through is the API quota consulted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::cascade::CascadeSpec;
use crate::circuit_breaker::{BreakerKey, BreakerRegistry, CircuitBreakerConfig, CircuitStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::counters::Counters;
use crate::health::HealthSignals;
use crate::metrics::{CascadeCounts, MetricsSnapshot};
use crate::quota::{ApiLimits, QuotaTracker};
use crate::GovernorError;

/// Consecutive failures on one breaker that count as an error burst.
pub const ERROR_BURST_THRESHOLD: u32 = 3;

/// Why a call was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    CircuitOpen,
    RateLimited,
    /// Produced by strict clients when the governor cannot be reached
    GovernorUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit breaker open",
            Self::RateLimited => "rate limit exceeded",
            Self::GovernorUnavailable => "governor unavailable",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialReason>,
}

impl PermissionDecision {
    pub fn approved() -> Self {
        Self {
            allowed: true,
            reason: "approved".to_string(),
            denial: None,
        }
    }

    pub fn denied(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: reason.as_str().to_string(),
            denial: Some(reason),
        }
    }

    /// An allowed decision carrying a custom reason.
    pub fn allowed_with_reason(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            denial: None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.denial == Some(DenialReason::RateLimited)
    }
}

/// Composes the quota tracker and breaker registry into a single decision.
#[derive(Debug)]
pub struct AdmissionController {
    quotas: QuotaTracker,
    breakers: BreakerRegistry,
    counters: Counters,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new<I>(apis: I, breaker_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = (String, ApiLimits)>,
    {
        Self {
            quotas: QuotaTracker::new(apis, clock.clone()),
            breakers: BreakerRegistry::new(breaker_config),
            counters: Counters::new(),
            clock,
        }
    }

    /// Build from configuration using the system clock.
    pub fn from_config(config: &GovernorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &GovernorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.apis.iter().map(|(name, limits)| (name.clone(), *limits)),
            config.circuit_breaker.clone(),
            clock,
        )
    }

    /// Decide whether `cascade_id` may call `api` now.
    pub fn request_permission(
        &self,
        cascade_id: &str,
        api: &str,
    ) -> Result<PermissionDecision, GovernorError> {
        self.check_call_site(cascade_id, api)?;

        let key = BreakerKey::new(cascade_id, api);
        let breaker = self.breakers.get_or_create(&key);
        let now = self.clock.now();

        let (breaker_allows, status) = {
            let mut breaker = breaker.lock();
            let allows = breaker.try_acquire(now);
            (allows, breaker.status())
        };

        if !breaker_allows {
            self.counters.circuit_blocked();
            tracing::debug!(cascade_id, api, state = %status, "Denied: circuit breaker open");
            return Ok(PermissionDecision::denied(DenialReason::CircuitOpen));
        }

        if status == CircuitStatus::HalfOpen {
            tracing::info!(cascade_id, api, "Circuit half-open, admitting probe");
        }

        if !self.quotas.try_reserve(api)? {
            self.counters.rate_limited();
            tracing::debug!(cascade_id, api, "Denied: rate limit exceeded");
            return Ok(PermissionDecision::denied(DenialReason::RateLimited));
        }

        self.counters.approved();
        tracing::debug!(cascade_id, api, "Approved");
        Ok(PermissionDecision::approved())
    }

    /// Feed the outcome of a call back into its breaker and the counters.
    ///
    /// Returns the breaker state after the update.
    pub fn record_result(
        &self,
        cascade_id: &str,
        api: &str,
        success: bool,
        error_message: &str,
    ) -> Result<CircuitStatus, GovernorError> {
        self.check_call_site(cascade_id, api)?;

        let key = BreakerKey::new(cascade_id, api);
        let breaker = self.breakers.get_or_create(&key);
        let now = self.clock.now();

        let (before, after, failures) = {
            let mut breaker = breaker.lock();
            let before = breaker.status();
            let failures = if success {
                breaker.record_success();
                0
            } else {
                breaker.record_failure(now)
            };
            (before, breaker.status(), failures)
        };

        if success {
            self.counters.result_success();
        } else {
            self.counters.result_failure();
            if failures >= ERROR_BURST_THRESHOLD {
                self.counters.error_burst();
            }
        }

        match (before, after) {
            (CircuitStatus::Closed, CircuitStatus::Open) => tracing::warn!(
                cascade_id,
                api,
                failures,
                error = error_message,
                "Circuit opened after repeated failures"
            ),
            (CircuitStatus::HalfOpen, CircuitStatus::Open) => tracing::warn!(
                cascade_id,
                api,
                error = error_message,
                "Circuit reopened after failed probe"
            ),
            (CircuitStatus::HalfOpen, CircuitStatus::Closed) => {
                tracing::info!(cascade_id, api, "Circuit closed after successful probe")
            }
            _ if !success => tracing::debug!(
                cascade_id,
                api,
                failures,
                error = error_message,
                "Failure recorded"
            ),
            _ => {}
        }

        Ok(after)
    }

    /// Reject cascade specs that reference unconfigured APIs or are malformed.
    pub fn validate_spec(&self, spec: &CascadeSpec) -> Result<(), GovernorError> {
        spec.validate_shape()?;

        if let Some(unknown) = spec.required_apis.iter().find(|api| !self.quotas.contains(api)) {
            return Err(GovernorError::UnknownApi(unknown.clone()));
        }

        Ok(())
    }

    fn check_call_site(&self, cascade_id: &str, api: &str) -> Result<(), GovernorError> {
        if cascade_id.trim().is_empty() {
            return Err(GovernorError::InvalidCascadeId(
                "cascade id must not be empty".to_string(),
            ));
        }

        if !self.quotas.contains(api) {
            return Err(GovernorError::UnknownApi(api.to_string()));
        }

        Ok(())
    }

    /// Inputs for the processor's health predicate.
    pub fn health_signals(&self, active_cascades: usize) -> HealthSignals {
        let (successes, failures) = self.counters.results();
        HealthSignals {
            active_cascades,
            successes,
            failures,
            open_breakers: self.breakers.open_count(),
        }
    }

    /// Aggregate everything into a metrics snapshot.
    pub fn snapshot(
        &self,
        active_cascades: usize,
        queued_cascades: usize,
        processing_paused: bool,
    ) -> MetricsSnapshot {
        let counters = self.counters.snapshot();
        MetricsSnapshot::compute(
            &counters,
            &self.quotas.usage_all(),
            self.breakers.counts(),
            CascadeCounts::from_counters(&counters, active_cascades, queued_cascades),
            processing_paused,
        )
    }

    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
