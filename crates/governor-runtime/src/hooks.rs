//! Integration helpers for code that runs its own cascades.
//!
//! [`governed`] wraps a unit of work that touches several APIs: it asks
//! permission for each one up front, runs the work, then reports the
//! outcome against every API. [`CascadeSession`] is the step-by-step
//! variant for existing code that cannot be restructured around a closure.

use std::future::Future;
use thiserror::Error;

use governor_core::{CascadeId, CascadeSpec};

use crate::client::{ClientError, GovernorClient, ResultReport};

/// Errors from [`governed`].
#[derive(Error, Debug)]
pub enum GovernedError<E> {
    #[error("Blocked on {api}: {reason}")]
    Blocked { api: String, reason: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Cascade failed: {0}")]
    Cascade(E),
}

/// Run `work` under governance for all of `apis`.
///
/// Nothing runs unless every API is admitted. The work's outcome is
/// reported against each API; a failed report is logged, not returned.
pub async fn governed<T, E, F, Fut>(
    client: &GovernorClient,
    cascade_id: &str,
    apis: &[&str],
    work: F,
) -> Result<T, GovernedError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for api in apis {
        let decision = client.request_permission(cascade_id, api).await?;
        if !decision.allowed {
            tracing::warn!(cascade_id, api, reason = %decision.reason, "Governed cascade blocked");
            return Err(GovernedError::Blocked {
                api: api.to_string(),
                reason: decision.reason,
            });
        }
    }

    let outcome = work().await;

    for api in apis {
        let report = match &outcome {
            Ok(_) => ResultReport::success(cascade_id, *api),
            Err(e) => ResultReport::failure(cascade_id, *api, e.to_string()),
        };
        if let Err(e) = client.record_result(report).await {
            tracing::warn!(cascade_id, api, error = %e, "Failed to report governed result");
        }
    }

    outcome.map_err(GovernedError::Cascade)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session has no cascade; call start() first")]
    NotStarted,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Step-by-step governance for legacy call sites.
#[derive(Debug, Clone)]
pub struct CascadeSession {
    client: GovernorClient,
    cascade_id: Option<CascadeId>,
}

impl CascadeSession {
    pub fn new(client: GovernorClient) -> Self {
        Self {
            client,
            cascade_id: None,
        }
    }

    pub fn cascade_id(&self) -> Option<&CascadeId> {
        self.cascade_id.as_ref()
    }

    /// Submit a cascade and bind this session to it.
    pub async fn start<I, S>(&mut self, name: &str, apis: I) -> Result<CascadeId, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CascadeSpec::new(name, apis)
            .with_payload(serde_json::json!({ "source": "legacy_integration" }));

        let id = self.client.submit(&spec).await?;
        self.cascade_id = Some(id.clone());
        Ok(id)
    }

    /// Whether the next call to `api` may proceed.
    pub async fn check_api(&self, api: &str) -> Result<bool, SessionError> {
        let id = self.cascade_id.as_ref().ok_or(SessionError::NotStarted)?;
        let decision = self.client.request_permission(id.as_str(), api).await?;
        Ok(decision.allowed)
    }

    /// No-op before `start()`.
    pub async fn report_success(&self, api: &str) -> Result<(), SessionError> {
        match &self.cascade_id {
            Some(id) => Ok(self
                .client
                .record_result(ResultReport::success(id.as_str(), api))
                .await?),
            None => Ok(()),
        }
    }

    /// No-op before `start()`.
    pub async fn report_failure(&self, api: &str, error: &str) -> Result<(), SessionError> {
        match &self.cascade_id {
            Some(id) => Ok(self
                .client
                .record_result(ResultReport::failure(id.as_str(), api, error))
                .await?),
            None => Ok(()),
        }
    }
}
