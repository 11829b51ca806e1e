//! Step executor trait and common types.

use async_trait::async_trait;
use governor_core::Cascade;
use thiserror::Error;

/// Errors from executing a cascade step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{api} call failed: {message}")]
    Failed { api: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    pub fn failed(api: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            api: api.into(),
            message: message.into(),
        }
    }
}

/// Performs the actual external call for one step of a cascade.
///
/// # Contract
/// - Called only after the governor approved `api` for this cascade
/// - Called with no governor lock held; it may take as long as it needs
/// - The returned result is reported back to the governor as the
///   step's outcome
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute the step of `cascade` that calls `api`.
    async fn execute(&self, cascade: &Cascade, api: &str) -> Result<(), StepError>;
}
