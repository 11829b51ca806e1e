//! Client protocol for code that calls external APIs under governance.
//!
//! A [`GovernorClient`] wraps a [`GovernorTransport`] and applies the
//! configured [`FallbackPolicy`] when the governor cannot be reached.
//! Fail-open is the default: an unreachable governor allows the call and
//! logs a warning. Fail-closed denies it instead.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;

use governor_core::{
    CascadeId, CascadeSpec, ClientConfig, DenialReason, FallbackPolicy, GovernorError,
    PermissionDecision,
};

use crate::governor::GovernorState;
use crate::RuntimeError;

/// Reason attached to calls allowed because the governor was unreachable.
pub const OFFLINE_REASON: &str = "governor offline - proceeding with caution";

/// Errors surfaced by a transport or client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Governor unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Rejected(#[from] GovernorError),
}

/// Outcome of one API call, as reported by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReport {
    pub cascade_id: String,
    pub api_name: String,
    pub success: bool,

    #[serde(default)]
    pub error_message: String,
}

impl ResultReport {
    pub fn success(cascade_id: impl Into<String>, api_name: impl Into<String>) -> Self {
        Self {
            cascade_id: cascade_id.into(),
            api_name: api_name.into(),
            success: true,
            error_message: String::new(),
        }
    }

    pub fn failure(
        cascade_id: impl Into<String>,
        api_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            cascade_id: cascade_id.into(),
            api_name: api_name.into(),
            success: false,
            error_message: error_message.into(),
        }
    }
}

/// How a client reaches the governor.
#[async_trait]
pub trait GovernorTransport: Send + Sync {
    async fn request_permission(
        &self,
        cascade_id: &str,
        api_name: &str,
    ) -> Result<PermissionDecision, ClientError>;

    async fn record_result(&self, report: &ResultReport) -> Result<(), ClientError>;

    async fn submit(&self, spec: &CascadeSpec) -> Result<CascadeId, ClientError>;
}

/// In-process transport to a [`crate::Governor`].
///
/// Reports the governor as unavailable once it has stopped accepting work
/// or has been dropped.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    state: Weak<GovernorState>,
}

impl LocalTransport {
    pub(crate) fn new(state: Weak<GovernorState>) -> Self {
        Self { state }
    }

    fn upgrade(&self) -> Result<Arc<GovernorState>, ClientError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| ClientError::Unavailable("governor dropped".to_string()))?;

        if !state.accepting.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ClientError::Unavailable("governor shut down".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl GovernorTransport for LocalTransport {
    async fn request_permission(
        &self,
        cascade_id: &str,
        api_name: &str,
    ) -> Result<PermissionDecision, ClientError> {
        let state = self.upgrade()?;
        Ok(state.admission.request_permission(cascade_id, api_name)?)
    }

    async fn record_result(&self, report: &ResultReport) -> Result<(), ClientError> {
        let state = self.upgrade()?;
        state.admission.record_result(
            &report.cascade_id,
            &report.api_name,
            report.success,
            &report.error_message,
        )?;
        Ok(())
    }

    async fn submit(&self, spec: &CascadeSpec) -> Result<CascadeId, ClientError> {
        let state = self.upgrade()?;
        state.submit(spec.clone()).map_err(|e| match e {
            RuntimeError::Governor(e) => ClientError::Rejected(e),
            other => ClientError::Unavailable(other.to_string()),
        })
    }
}

/// Outcome of a single permission attempt, as seen by the retry loop.
#[derive(Debug)]
enum Attempt {
    RateLimited(PermissionDecision),
    Client(ClientError),
}

/// Caller-side handle with fallback and optional rate-limit retries.
#[derive(Clone)]
pub struct GovernorClient {
    transport: Arc<dyn GovernorTransport>,
    config: ClientConfig,
}

impl GovernorClient {
    pub fn new(transport: Arc<dyn GovernorTransport>, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ask permission for one call.
    ///
    /// Rate-limit denials are retried with exponential backoff when
    /// `rate_limit_retries > 0`. An unreachable governor is resolved by the
    /// fallback policy; a rejected request (unknown API) is returned as-is.
    pub async fn request_permission(
        &self,
        cascade_id: &str,
        api_name: &str,
    ) -> Result<PermissionDecision, ClientError> {
        let outcome = if self.config.rate_limit_retries == 0 {
            self.attempt(cascade_id, api_name).await
        } else {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(self.config.retry_min_delay)
                .with_max_delay(self.config.retry_max_delay)
                .with_max_times(self.config.rate_limit_retries);

            (|| self.attempt(cascade_id, api_name))
                .retry(backoff)
                .sleep(tokio::time::sleep)
                .when(|e| matches!(e, Attempt::RateLimited(_)))
                .notify(|_, delay| {
                    tracing::debug!(cascade_id, api = api_name, delay = ?delay, "Rate limited, retrying");
                })
                .await
        };

        match outcome {
            Ok(decision) | Err(Attempt::RateLimited(decision)) => Ok(decision),
            Err(Attempt::Client(ClientError::Unavailable(cause))) => {
                Ok(self.offline_decision(cascade_id, api_name, &cause))
            }
            Err(Attempt::Client(e)) => Err(e),
        }
    }

    /// Report the outcome of a call.
    ///
    /// Under fail-open an unreachable governor is logged and ignored.
    pub async fn record_result(&self, report: ResultReport) -> Result<(), ClientError> {
        match self.transport.record_result(&report).await {
            Err(ClientError::Unavailable(cause)) if self.fails_open() => {
                tracing::warn!(
                    cascade_id = %report.cascade_id,
                    api = %report.api_name,
                    cause = %cause,
                    "Governor offline, result not recorded"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Submit a cascade. There is no fallback for submission: without a
    /// governor there is nothing to queue on.
    pub async fn submit(&self, spec: &CascadeSpec) -> Result<CascadeId, ClientError> {
        self.transport.submit(spec).await
    }

    async fn attempt(&self, cascade_id: &str, api_name: &str) -> Result<PermissionDecision, Attempt> {
        match self.transport.request_permission(cascade_id, api_name).await {
            Ok(decision) if decision.is_rate_limited() => Err(Attempt::RateLimited(decision)),
            Ok(decision) => Ok(decision),
            Err(e) => Err(Attempt::Client(e)),
        }
    }

    fn fails_open(&self) -> bool {
        self.config.fallback == FallbackPolicy::FailOpen
    }

    fn offline_decision(&self, cascade_id: &str, api_name: &str, cause: &str) -> PermissionDecision {
        match self.config.fallback {
            FallbackPolicy::FailOpen => {
                tracing::warn!(cascade_id, api = api_name, cause, "Governor offline, allowing call");
                PermissionDecision::allowed_with_reason(OFFLINE_REASON)
            }
            FallbackPolicy::FailClosed => {
                tracing::warn!(cascade_id, api = api_name, cause, "Governor offline, denying call");
                PermissionDecision::denied(DenialReason::GovernorUnavailable)
            }
        }
    }
}

impl std::fmt::Debug for GovernorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernorClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays scripted permission responses.
    #[derive(Default)]
    struct ScriptedTransport {
        permissions: Mutex<VecDeque<Result<PermissionDecision, ClientError>>>,
        reports: Mutex<Vec<ResultReport>>,
        offline: bool,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<PermissionDecision, ClientError>>) -> Self {
            Self {
                permissions: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn offline() -> Self {
            Self {
                offline: true,
                ..Default::default()
            }
        }

        fn remaining(&self) -> usize {
            self.permissions.lock().len()
        }
    }

    #[async_trait]
    impl GovernorTransport for ScriptedTransport {
        async fn request_permission(
            &self,
            _cascade_id: &str,
            _api_name: &str,
        ) -> Result<PermissionDecision, ClientError> {
            if self.offline {
                return Err(ClientError::Unavailable("connection refused".to_string()));
            }
            self.permissions
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(PermissionDecision::approved()))
        }

        async fn record_result(&self, report: &ResultReport) -> Result<(), ClientError> {
            if self.offline {
                return Err(ClientError::Unavailable("connection refused".to_string()));
            }
            self.reports.lock().push(report.clone());
            Ok(())
        }

        async fn submit(&self, _spec: &CascadeSpec) -> Result<CascadeId, ClientError> {
            if self.offline {
                return Err(ClientError::Unavailable("connection refused".to_string()));
            }
            Ok(CascadeId::new("cascade_1_0"))
        }
    }

    fn client(transport: ScriptedTransport, config: ClientConfig) -> (GovernorClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        (GovernorClient::new(transport.clone(), config), transport)
    }

    #[tokio::test]
    async fn test_fail_open_allows_when_offline() {
        let (client, _) = client(ScriptedTransport::offline(), ClientConfig::default());

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, OFFLINE_REASON);

        // Reporting is silently dropped.
        client
            .record_result(ResultReport::success("c1", "github"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fail_closed_denies_when_offline() {
        let config = ClientConfig {
            fallback: FallbackPolicy::FailClosed,
            ..Default::default()
        };
        let (client, _) = client(ScriptedTransport::offline(), config);

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(DenialReason::GovernorUnavailable));

        let result = client
            .record_result(ResultReport::failure("c1", "github", "timeout"))
            .await;
        assert!(matches!(result, Err(ClientError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_submit_never_fails_open() {
        let (client, _) = client(ScriptedTransport::offline(), ClientConfig::default());

        let result = client.submit(&CascadeSpec::new("sync", ["github"])).await;
        assert!(matches!(result, Err(ClientError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_rejection_is_not_masked_by_fallback() {
        let (client, _) = client(
            ScriptedTransport::with(vec![Err(ClientError::Rejected(GovernorError::UnknownApi(
                "myspace".to_string(),
            )))]),
            ClientConfig::default(),
        );

        let result = client.request_permission("c1", "myspace").await;
        assert_eq!(
            result,
            Err(ClientError::Rejected(GovernorError::UnknownApi(
                "myspace".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_denial_returned_without_retries() {
        let (client, transport) = client(
            ScriptedTransport::with(vec![
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::approved()),
            ]),
            ClientConfig::default(),
        );

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert!(decision.is_rate_limited());
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_until_approved() {
        let config = ClientConfig {
            rate_limit_retries: 3,
            retry_min_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        let (client, transport) = client(
            ScriptedTransport::with(vec![
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::approved()),
            ]),
            config,
        );

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_is_not_retried() {
        let config = ClientConfig {
            rate_limit_retries: 3,
            retry_min_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (client, transport) = client(
            ScriptedTransport::with(vec![
                Ok(PermissionDecision::denied(DenialReason::CircuitOpen)),
                Ok(PermissionDecision::approved()),
            ]),
            config,
        );

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert_eq!(decision.denial, Some(DenialReason::CircuitOpen));
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_denial() {
        let config = ClientConfig {
            rate_limit_retries: 2,
            retry_min_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let (client, transport) = client(
            ScriptedTransport::with(vec![
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::denied(DenialReason::RateLimited)),
                Ok(PermissionDecision::approved()),
            ]),
            config,
        );

        let decision = client.request_permission("c1", "github").await.unwrap();
        assert!(decision.is_rate_limited());
        assert_eq!(transport.remaining(), 1);
    }

    #[tokio::test]
    async fn test_reports_forwarded() {
        let (client, transport) = client(ScriptedTransport::default(), ClientConfig::default());

        client
            .record_result(ResultReport::failure("c1", "airtable", "502"))
            .await
            .unwrap();

        let reports = transport.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);
        assert_eq!(reports[0].error_message, "502");
    }
}
