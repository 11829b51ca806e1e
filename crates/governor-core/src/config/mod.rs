//! Governor configuration.
//!
//! Configuration files are YAML or JSON, validated against an embedded
//! JSON Schema before they are deserialised. This module holds the typed
//! configuration and the file parser.

mod parser;

pub use parser::{is_valid_api_name, schema_violations, ConfigError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::HealthPolicy;
use crate::quota::ApiLimits;

/// Durations as whole seconds or humantime strings (`"60s"`, `"1m 30s"`).
pub(crate) mod duration_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
        }
    }
}

/// Complete governor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Known APIs and their ceilings
    pub apis: BTreeMap<String, ApiLimits>,

    pub circuit_breaker: CircuitBreakerConfig,
    pub processor: ProcessorConfig,
    pub telemetry: TelemetryConfig,
    pub outcomes: OutcomeConfig,
    pub client: ClientConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            apis: default_apis(),
            circuit_breaker: CircuitBreakerConfig::default(),
            processor: ProcessorConfig::default(),
            telemetry: TelemetryConfig::default(),
            outcomes: OutcomeConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// The APIs cascades called before per-deployment configuration existed.
pub fn default_apis() -> BTreeMap<String, ApiLimits> {
    [
        ("charityapi", ApiLimits::new(10, 500)),
        ("airtable", ApiLimits::new(100, 5000)),
        ("github", ApiLimits::new(60, 5000)),
        ("perplexity", ApiLimits::new(20, 1000)),
        ("openai", ApiLimits::new(60, 3000)),
    ]
    .into_iter()
    .map(|(name, limits)| (name.to_string(), limits))
    .collect()
}

/// Processor loop settings and the health policy it enforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    #[serde(flatten)]
    pub health: HealthPolicy,

    /// How long a dequeue waits before re-checking health while idle
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,

    /// Sleep after re-queueing a cascade under backpressure
    #[serde(with = "duration_serde")]
    pub pause_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            health: HealthPolicy::default(),
            poll_interval: Duration::from_secs(1),
            pause_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// JSON file rewritten on every tick
    pub metrics_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            metrics_path: None,
        }
    }
}

/// Retention of finished cascade outcomes for status lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    #[serde(with = "duration_serde")]
    pub retention: Duration,
    pub capacity: u64,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(600),
            capacity: 10_000,
        }
    }
}

/// What a client does when the governor cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Allow the call and log a warning
    #[default]
    FailOpen,

    /// Deny the call
    FailClosed,
}

/// Client-side behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub fallback: FallbackPolicy,

    /// Extra attempts after a rate-limit denial (0 disables retrying)
    pub rate_limit_retries: usize,

    #[serde(with = "duration_serde")]
    pub retry_min_delay: Duration,

    #[serde(with = "duration_serde")]
    pub retry_max_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::FailOpen,
            rate_limit_retries: 0,
            retry_min_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}
