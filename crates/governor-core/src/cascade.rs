//! Cascade data model.
//!
//! A cascade is a queued unit of multi-step work that needs one or more
//! external API calls. The governor never interprets the payload; it only
//! cares about which APIs the cascade declares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::GovernorError;

/// Identifier assigned to a cascade on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CascadeId(String);

impl CascadeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CascadeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CascadeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generates `cascade_<unix-millis>_<sequence>` ids.
///
/// The sequence suffix keeps ids distinct when several cascades are
/// submitted within the same millisecond.
#[derive(Debug, Default)]
pub struct CascadeIdGenerator {
    sequence: AtomicU64,
}

impl CascadeIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CascadeId {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        CascadeId(format!("cascade_{}_{}", Utc::now().timestamp_millis(), seq))
    }
}

/// Submission priority.
///
/// Accepted and carried with the cascade; ordering stays FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeSpec {
    /// Human-readable name
    pub name: String,

    /// APIs the cascade calls, in execution order
    #[serde(alias = "apis")]
    pub required_apis: Vec<String>,

    /// Opaque data handed to the step executor
    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,
}

impl CascadeSpec {
    pub fn new<I, S>(name: impl Into<String>, required_apis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            required_apis: required_apis.into_iter().map(Into::into).collect(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Structural checks that do not need to know the configured APIs.
    pub fn validate_shape(&self) -> Result<(), GovernorError> {
        if self.name.trim().is_empty() {
            return Err(GovernorError::InvalidCascade(
                "name must not be empty".to_string(),
            ));
        }

        if self.required_apis.is_empty() {
            return Err(GovernorError::InvalidCascade(format!(
                "cascade '{}' declares no required APIs",
                self.name
            )));
        }

        if let Some(blank) = self.required_apis.iter().find(|api| api.trim().is_empty()) {
            return Err(GovernorError::InvalidCascade(format!(
                "cascade '{}' declares a blank API name '{}'",
                self.name, blank
            )));
        }

        Ok(())
    }
}

/// A cascade owned by the queue or the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cascade {
    pub id: CascadeId,
    pub spec: CascadeSpec,
    pub queued_at: DateTime<Utc>,

    /// Set each time the processor pulls the cascade off the queue
    pub last_dequeued_at: Option<DateTime<Utc>>,

    /// Times the cascade went back to the tail under backpressure
    pub requeues: u32,
}

impl Cascade {
    pub fn new(id: CascadeId, spec: CascadeSpec) -> Self {
        Self {
            id,
            spec,
            queued_at: Utc::now(),
            last_dequeued_at: None,
            requeues: 0,
        }
    }

    pub fn required_apis(&self) -> &[String] {
        &self.spec.required_apis
    }
}

/// Lifecycle position of a cascade.
///
/// QUEUED → ACTIVE → {COMPLETED, FAILED}; a paused cascade goes back to
/// QUEUED with its requeue count bumped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CascadeStatus {
    Queued {
        requeues: u32,
        last_dequeued_at: Option<DateTime<Utc>>,
    },
    Active {
        started_at: DateTime<Utc>,
    },
    Completed {
        finished_at: DateTime<Utc>,
    },
    Failed {
        api: String,
        reason: String,
        finished_at: DateTime<Utc>,
    },
}

impl CascadeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}
