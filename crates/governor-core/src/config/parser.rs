//! Configuration parsing from YAML/JSON.
//!
//! Documents are checked against schema/governor-config.schema.json before
//! they are deserialised, so a misspelt section or field is reported
//! instead of silently falling back to its default.

use jsonschema::Validator;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::GovernorConfig;

const SCHEMA_SOURCE: &str = include_str!("../../../../schema/governor-config.schema.json");

lazy_static! {
    /// Lowercase identifier: letter first, then letters, digits, `_` or `-`
    static ref API_NAME_PATTERN: Regex = Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap();

    static ref CONFIG_SCHEMA: Result<Validator, String> = compile_schema();
}

fn compile_schema() -> Result<Validator, String> {
    let schema: Value = serde_json::from_str(SCHEMA_SOURCE)
        .map_err(|e| format!("embedded config schema is not JSON: {}", e))?;
    jsonschema::validator_for(&schema)
        .map_err(|e| format!("embedded config schema does not compile: {}", e))
}

/// Whether `name` is acceptable as an API key in the configuration.
pub fn is_valid_api_name(name: &str) -> bool {
    API_NAME_PATTERN.is_match(name)
}

/// Every schema violation in `document`, as `"<pointer>: <message>"`.
///
/// Empty when the document conforms.
pub fn schema_violations(document: &Value) -> Vec<String> {
    let validator = match CONFIG_SCHEMA.as_ref() {
        Ok(validator) => validator,
        Err(e) => return vec![e.clone()],
    };

    validator
        .iter_errors(document)
        .map(|error| {
            let pointer = error.instance_path.to_string();
            let pointer = if pointer.is_empty() { "/" } else { pointer.as_str() };
            format!("{}: {}", pointer, error)
        })
        .collect()
}

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

impl GovernorConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Schema-check, deserialise and validate an already parsed document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        // An empty YAML document means "all defaults".
        let value = if value.is_null() {
            serde_json::json!({})
        } else {
            value
        };

        let violations = schema_violations(&value);
        if !violations.is_empty() {
            return Err(ConfigError::SchemaViolation(violations));
        }

        let config: GovernorConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, choosing the format by extension (`.json` or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apis.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one API must be configured".to_string(),
            ));
        }

        for (name, limits) in &self.apis {
            if !is_valid_api_name(name) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid API name '{}'",
                    name
                )));
            }

            if limits.requests_per_minute == 0 || limits.requests_per_hour == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "API '{}' must allow at least one request per window",
                    name
                )));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        let health = &self.processor.health;
        if !(0.0..=1.0).contains(&health.failure_rate_ceiling) {
            return Err(ConfigError::ValidationError(format!(
                "processor.failure_rate_ceiling must be within [0, 1], got {}",
                health.failure_rate_ceiling
            )));
        }

        if health.max_active_cascades == 0 {
            return Err(ConfigError::ValidationError(
                "processor.max_active_cascades must be at least 1".to_string(),
            ));
        }

        if self.processor.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "processor.poll_interval must be positive".to_string(),
            ));
        }

        if self.telemetry.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "telemetry.interval must be positive".to_string(),
            ));
        }

        if self.outcomes.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "outcomes.capacity must be at least 1".to_string(),
            ));
        }

        if self.client.retry_min_delay > self.client.retry_max_delay {
            return Err(ConfigError::ValidationError(
                "client.retry_min_delay must not exceed client.retry_max_delay".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackPolicy;
    use std::time::Duration;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = GovernorConfig::from_yaml("").unwrap();
        assert_eq!(config, GovernorConfig::default());
        assert_eq!(config.apis.len(), 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.processor.health.max_active_cascades, 10);
        assert_eq!(config.telemetry.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
apis:
  github:
    requests_per_minute: 60
    requests_per_hour: 5000
  charityapi:
    requests_per_minute: 10
    requests_per_hour: 500
circuit_breaker:
  failure_threshold: 3
  open_timeout: 90
processor:
  max_active_cascades: 4
  failure_rate_ceiling: 0.5
  min_sample_for_failure_rate: 20
  max_open_breakers_before_pause: 1
  poll_interval: 250ms
  pause_backoff: "2s"
telemetry:
  interval: 1m
  metrics_path: metrics/governor.json
client:
  fallback: fail_closed
  rate_limit_retries: 2
"#;

        let config = GovernorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.apis.len(), 2);
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_secs(90));
        assert_eq!(config.processor.health.max_active_cascades, 4);
        assert_eq!(config.processor.health.min_sample_for_failure_rate, 20);
        assert_eq!(config.processor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.processor.pause_backoff, Duration::from_secs(2));
        assert_eq!(config.telemetry.interval, Duration::from_secs(60));
        assert_eq!(config.client.fallback, FallbackPolicy::FailClosed);
        assert_eq!(config.client.rate_limit_retries, 2);
        assert_eq!(config.outcomes.capacity, 10_000);
    }

    #[test]
    fn test_json_round_trip_through_yaml() {
        let config = GovernorConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(GovernorConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_unknown_section_rejected_by_schema() {
        let result = GovernorConfig::from_json(r#"{"metrics": {}}"#);
        assert!(matches!(result, Err(ConfigError::SchemaViolation(_))));
    }

    #[test]
    fn test_bad_api_name_rejected() {
        let yaml = r#"
apis:
  GitHub:
    requests_per_minute: 1
    requests_per_hour: 1
"#;
        assert!(GovernorConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let yaml = r#"
apis:
  github:
    requests_per_minute: 0
    requests_per_hour: 10
"#;
        assert!(GovernorConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_failure_rate_out_of_range_rejected() {
        let mut config = GovernorConfig::default();
        config.processor.health.failure_rate_ceiling = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_unparseable_duration_rejected() {
        let yaml = r#"
circuit_breaker:
  open_timeout: "60 parsecs"
"#;
        assert!(GovernorConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_schema_accepts_every_section() {
        let document = serde_json::json!({
            "apis": {
                "github": { "requests_per_minute": 60, "requests_per_hour": 5000 },
                "perplexity": { "requests_per_minute": 20, "requests_per_hour": 1000 }
            },
            "circuit_breaker": { "failure_threshold": 5, "open_timeout": "60s" },
            "processor": {
                "max_active_cascades": 10,
                "failure_rate_ceiling": 0.2,
                "min_sample_for_failure_rate": 10,
                "max_open_breakers_before_pause": 3,
                "poll_interval": 1,
                "pause_backoff": "5s"
            },
            "telemetry": { "interval": 30, "metrics_path": "metrics/cascade_governor.json" },
            "outcomes": { "retention": "10m", "capacity": 500 },
            "client": { "fallback": "fail_open", "rate_limit_retries": 3 }
        });
        assert_eq!(schema_violations(&document), Vec::<String>::new());
        assert!(schema_violations(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_schema_violations_name_the_offending_field() {
        let document = serde_json::json!({
            "apis": { "github": { "requests_per_minute": 60 } },
            "processor": { "failure_rate_ceiling": 1.2 }
        });
        let violations = schema_violations(&document);

        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.starts_with("/apis/github:")));
        assert!(violations
            .iter()
            .any(|v| v.starts_with("/processor/failure_rate_ceiling:")));
    }

    #[test]
    fn test_schema_rejects_misspelt_fields_and_values() {
        let misspelt = serde_json::json!({
            "circuit_breaker": { "failure_threshold": 5, "success_threshold": 2 }
        });
        assert!(!schema_violations(&misspelt).is_empty());

        let unknown_fallback = serde_json::json!({ "client": { "fallback": "retry_forever" } });
        assert!(!schema_violations(&unknown_fallback).is_empty());

        let uppercase_api = serde_json::json!({
            "apis": { "GitHub": { "requests_per_minute": 60, "requests_per_hour": 100 } }
        });
        assert!(!schema_violations(&uppercase_api).is_empty());
    }

    #[test]
    fn test_api_name_pattern() {
        assert!(is_valid_api_name("charityapi"));
        assert!(is_valid_api_name("google-sheets_v4"));
        assert!(!is_valid_api_name("4chan"));
        assert!(!is_valid_api_name("Airtable"));
        assert!(!is_valid_api_name(""));
    }
}
