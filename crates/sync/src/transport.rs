//! Remote mutation API boundary.
//!
//! The server exposes one idempotent endpoint per action kind; idempotency is
//! what makes at-least-once delivery safe after a crash between submit and
//! local removal. The engine only needs the trait below — tests and
//! alternative transports plug in here.

use async_trait::async_trait;
use serde_json::Value;

use crate::action::PendingAction;

/// Failure submitting a mutation, classified for retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request never produced an HTTP response (timeout, DNS, reset).
    #[error("network error: {0}")]
    Network(String),
    /// The API asked us to slow down.
    #[error("rate limited by the API")]
    RateLimited,
    /// Server-side failure (5xx); safe to retry.
    #[error("server error ({status}): {message}")]
    Upstream { status: u16, message: String },
    /// The API rejected the mutation (4xx); retrying cannot help.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => ApiError::RateLimited,
            s if s >= 500 => ApiError::Upstream { status: s, message },
            s => ApiError::Rejected { status: s, message },
        }
    }

    /// Transient errors are retried with backoff; permanent ones abandon the
    /// action and surface it for user resolution.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ApiError::Rejected { .. })
    }
}

/// Client for the remote mutation API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Submit one action. On success, returns the authoritative entity body
    /// (if the endpoint provides one) used to reconcile the local read model.
    async fn submit(&self, action: &PendingAction) -> Result<Option<Value>, ApiError>;
}
