//! # governor-core
//!
//! Deterministic control-plane state for the cascade governor.
//!
//! This crate answers one question for every outbound API call made by a
//! cascade: may this call proceed right now?
//!
//! ## Key Guarantees
//!
//! 1. **Per-API quotas**: no API is admitted more often than its
//!    per-minute and per-hour ceilings over any rolling window
//! 2. **Failure isolation**: every (cascade, API) pair has its own
//!    circuit breaker, so one misbehaving cascade never blocks others
//! 3. **Observable degradation**: every denial and failure increments a
//!    counter that surfaces in the metrics snapshot
//! 4. **No I/O**: nothing here blocks, sleeps or performs network calls
//!
//! ## Example
//!
//! ```rust,ignore
//! use governor_core::{AdmissionController, GovernorConfig};
//!
//! let controller = AdmissionController::from_config(&GovernorConfig::default());
//!
//! let decision = controller.request_permission("cascade_1", "github")?;
//! if decision.allowed {
//!     // call GitHub outside of any governor lock
//!     controller.record_result("cascade_1", "github", true, "")?;
//! }
//! ```

pub mod admission;
pub mod cascade;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod counters;
pub mod health;
pub mod metrics;
pub mod quota;

// Re-export main types at crate root
pub use admission::{AdmissionController, DenialReason, PermissionDecision};
pub use cascade::{Cascade, CascadeId, CascadeIdGenerator, CascadeSpec, CascadeStatus, Priority};
pub use circuit_breaker::{
    BreakerCounts, BreakerKey, BreakerRegistry, BreakerView, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, CircuitStatus,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClientConfig, ConfigError, FallbackPolicy, GovernorConfig, OutcomeConfig, ProcessorConfig,
    TelemetryConfig,
};
pub use counters::{CounterSnapshot, Counters};
pub use health::{HealthPolicy, HealthSignals, HealthVerdict, PauseReason};
pub use metrics::{CascadeCounts, MetricsSnapshot};
pub use quota::{ApiLimits, Quota, QuotaTracker, QuotaUsage};

use thiserror::Error;

/// Errors raised synchronously for call-site programming mistakes.
///
/// Admission denials are not errors; they come back as a
/// [`PermissionDecision`] with `allowed == false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("Unknown API: '{0}'")]
    UnknownApi(String),

    #[error("Invalid cascade spec: {0}")]
    InvalidCascade(String),

    #[error("Invalid cascade id: {0}")]
    InvalidCascadeId(String),
}
