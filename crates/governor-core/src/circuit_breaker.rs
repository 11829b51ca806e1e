//! Circuit breakers keyed by (cascade, API).
//!
//! When a cascade keeps failing against an API, its breaker opens and
//! further calls from that cascade to that API are denied until the open
//! timeout elapses. Other cascades calling the same API are unaffected.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::duration_serde;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe
    #[serde(with = "duration_serde")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are denied until the open timeout has elapsed since the last failure
    Open { last_failure: Instant },

    /// One probe has been admitted and its outcome is pending
    HalfOpen { probe_started: Instant },
}

/// State label without timing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

impl From<CircuitState> for CircuitStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open { .. } => Self::Open,
            CircuitState::HalfOpen { .. } => Self::HalfOpen,
        }
    }
}

/// Failure-tracking state machine for one (cascade, API) pair.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            config,
        }
    }

    /// Ask whether a call may go through, advancing OPEN → HALF_OPEN when
    /// the open timeout has elapsed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { last_failure } => {
                if now.saturating_duration_since(last_failure) >= self.config.open_timeout {
                    self.state = CircuitState::HalfOpen { probe_started: now };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { probe_started } => {
                // A probe whose outcome never arrived is abandoned after one timeout.
                if now.saturating_duration_since(probe_started) >= self.config.open_timeout {
                    self.state = CircuitState::HalfOpen { probe_started: now };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
            }
            // A late success from before the circuit opened does not close it.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call. Returns the consecutive failure count.
    pub fn record_failure(&mut self, now: Instant) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open { last_failure: now };
                }
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open { last_failure: now };
            }
        }

        self.consecutive_failures
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.into()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}

/// Registry key: one breaker per (cascade, API) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakerKey {
    pub cascade_id: String,
    pub api: String,
}

impl BreakerKey {
    pub fn new(cascade_id: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            cascade_id: cascade_id.into(),
            api: api.into(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cascade_id, self.api)
    }
}

/// Read-only copy of a breaker for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerView {
    pub key: BreakerKey,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
}

/// Number of breakers in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerCounts {
    #[serde(rename = "CLOSED")]
    pub closed: usize,
    #[serde(rename = "OPEN")]
    pub open: usize,
    #[serde(rename = "HALF_OPEN")]
    pub half_open: usize,
}

impl BreakerCounts {
    pub fn total(&self) -> usize {
        self.closed + self.open + self.half_open
    }
}

/// All breakers, created on demand.
///
/// The map lock is only taken for writing when a new pair appears; state
/// changes go through the per-breaker mutex.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<BreakerKey, Arc<Mutex<CircuitBreaker>>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Look up the breaker for a pair, creating a CLOSED one if absent.
    pub fn get_or_create(&self, key: &BreakerKey) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return breaker.clone();
        }

        self.breakers
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(breaker = %key, "Creating circuit breaker");
                Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone())))
            })
            .clone()
    }

    /// Inspect a breaker without creating it.
    pub fn view(&self, key: &BreakerKey) -> Option<BreakerView> {
        let breaker = self.breakers.read().get(key).cloned()?;
        let breaker = breaker.lock();
        Some(BreakerView {
            key: key.clone(),
            status: breaker.status(),
            consecutive_failures: breaker.consecutive_failures(),
        })
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count breakers by state.
    pub fn counts(&self) -> BreakerCounts {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();

        let mut counts = BreakerCounts::default();
        for breaker in breakers {
            match breaker.lock().status() {
                CircuitStatus::Closed => counts.closed += 1,
                CircuitStatus::Open => counts.open += 1,
                CircuitStatus::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }

    /// Breakers currently in the OPEN state.
    pub fn open_count(&self) -> usize {
        self.counts().open
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
