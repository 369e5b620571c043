//! HTTP surface of the idempotent endpoint.

pub mod app;
pub mod input;

use crate::core::IdempotencyError;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

pub use app::{AppState, build_router};
pub use input::{WebInputError, normalize_idempotency_key, normalize_request_id};

/// Backoff advertised when the store itself is unavailable or a claim was lost.
pub const UNAVAILABLE_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum WebError {
    Idempotency(IdempotencyError),
    Input(String),
}

impl From<IdempotencyError> for WebError {
    fn from(err: IdempotencyError) -> Self {
        WebError::Idempotency(err)
    }
}

impl From<WebInputError> for WebError {
    fn from(err: WebInputError) -> Self {
        WebError::Input(err.message().to_string())
    }
}

impl WebError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }
}

fn retry_after_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let message = match &self {
            WebError::Idempotency(err) => err.to_string(),
            WebError::Input(msg) => msg.clone(),
        };

        let (status, code, details, retry_after) = match self {
            WebError::Input(_) => (StatusCode::BAD_REQUEST, "input_error".to_string(), None, None),
            WebError::Idempotency(IdempotencyError::Conflict { .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "idempotency_key_reused".to_string(),
                None,
                None,
            ),
            WebError::Idempotency(IdempotencyError::InFlight { retry_after, .. }) => (
                StatusCode::CONFLICT,
                "request_in_flight".to_string(),
                None,
                Some(retry_after),
            ),
            WebError::Idempotency(IdempotencyError::StaleWrite { .. }) => (
                StatusCode::CONFLICT,
                "claim_lost".to_string(),
                None,
                Some(UNAVAILABLE_RETRY_AFTER),
            ),
            WebError::Idempotency(IdempotencyError::BackendUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "backend_unavailable".to_string(),
                None,
                Some(UNAVAILABLE_RETRY_AFTER),
            ),
            WebError::Idempotency(IdempotencyError::HandlerExecution(info)) => {
                let status = StatusCode::from_u16(info.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return error_response(
                    status,
                    ErrorResponse {
                        error: info.message,
                        code: info.code,
                        details: info.details,
                    },
                    None,
                );
            }
            WebError::Idempotency(IdempotencyError::Corrupt(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "corrupt_record".to_string(),
                None,
                None,
            ),
        };

        error_response(
            status,
            ErrorResponse {
                error: message,
                code,
                details,
            },
            retry_after,
        )
    }
}

fn error_response(status: StatusCode, body: ErrorResponse, retry_after: Option<Duration>) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(delay) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(delay)));
    }
    response
}

pub type Result<T> = std::result::Result<T, WebError>;
