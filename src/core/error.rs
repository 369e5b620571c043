use super::record::ErrorInfo;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a key-value backend adapter.
///
/// A lost condition (item already present, version moved on) is not an
/// error: adapters report those through `PutOutcome` / `CasOutcome`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt item: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdempotencyError {
    /// Same key, different payload. Not retryable with this key.
    #[error("Idempotency key '{key}' was already used for a different request")]
    Conflict { key: String },

    /// The original request is still executing. Retry after the hinted delay.
    #[error("Request with key '{key}' is still in progress")]
    InFlight { key: String, retry_after: Duration },

    /// The executor lost its claim; its outcome will not be the one replayed.
    #[error("Claim on key '{key}' was lost (expected version {expected_version})")]
    StaleWrite { key: String, expected_version: u64 },

    #[error("Idempotency store unavailable: {0}")]
    BackendUnavailable(String),

    /// Business logic failure, recorded and replayed verbatim.
    #[error("Handler failed: {}", .0.message)]
    HandlerExecution(ErrorInfo),

    #[error("Corrupt idempotency record: {0}")]
    Corrupt(String),
}

impl IdempotencyError {
    /// Whether the client may retry the same request with the same key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InFlight { .. } | Self::StaleWrite { .. } | Self::BackendUnavailable(_)
        )
    }
}

impl From<BackendError> for IdempotencyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::BackendUnavailable(msg),
            BackendError::Corrupt(msg) => Self::Corrupt(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
