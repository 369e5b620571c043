//! Header normalization for the idempotent endpoint.

use axum::http::HeaderValue;
use std::fmt;

/// Validation message returned when the idempotency key is not printable ASCII.
pub const IDEMPOTENCY_KEY_INVALID_MESSAGE: &str = "Idempotency-Key must be valid ASCII";
/// Validation message returned when the idempotency key is too long.
pub const IDEMPOTENCY_KEY_TOO_LONG_MESSAGE: &str = "Idempotency-Key must not exceed 128 characters";
/// Validation message returned when the body is not JSON.
pub const BODY_NOT_JSON_MESSAGE: &str = "Request body must be valid JSON";

/// Upper bound for normalized idempotency keys.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebInputError {
    message: &'static str,
}

impl WebInputError {
    fn new(message: &'static str) -> Self {
        Self { message }
    }

    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for WebInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

impl std::error::Error for WebInputError {}

/// Normalizes an optional idempotency key.
///
/// Empty/whitespace values become `None`.
pub fn normalize_idempotency_key(raw_key: Option<&str>) -> Result<Option<String>, WebInputError> {
    let Some(raw_key) = raw_key else {
        return Ok(None);
    };

    let trimmed = raw_key.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if !trimmed.is_ascii() {
        return Err(WebInputError::new(IDEMPOTENCY_KEY_INVALID_MESSAGE));
    }

    if trimmed.len() > IDEMPOTENCY_KEY_MAX_LEN {
        return Err(WebInputError::new(IDEMPOTENCY_KEY_TOO_LONG_MESSAGE));
    }

    Ok(Some(trimmed.to_string()))
}

/// Same as [`normalize_idempotency_key`] for a raw header value.
pub fn idempotency_key_from_header(
    value: Option<&HeaderValue>,
) -> Result<Option<String>, WebInputError> {
    let raw = value
        .map(|v| v.to_str())
        .transpose()
        .map_err(|_| WebInputError::new(IDEMPOTENCY_KEY_INVALID_MESSAGE))?;
    normalize_idempotency_key(raw)
}

/// Normalizes an optional request-correlation identifier.
///
/// Empty/whitespace values become `None`.
pub fn normalize_request_id(raw_request_id: Option<&str>) -> Option<String> {
    raw_request_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
