use super::input::{BODY_NOT_JSON_MESSAGE, idempotency_key_from_header, normalize_request_id};
use super::{Result, WebError};
use crate::handler::{IdempotentHandler, IncomingRequest, Outcome};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_REPLAYED_HEADER: &str = "idempotency-replayed";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<IdempotentHandler>,
    pub key_header: HeaderName,
}

impl AppState {
    pub fn new(handler: Arc<IdempotentHandler>) -> Self {
        Self {
            handler,
            key_header: HeaderName::from_static(DEFAULT_IDEMPOTENCY_HEADER),
        }
    }

    pub fn key_header(mut self, name: HeaderName) -> Self {
        self.key_header = name;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/health", get(healthcheck))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthcheck() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = normalize_request_id(
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok()),
    )
    .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (key, result) = match parse_request(&state, &headers, &body) {
        Ok(request) => state.handler.handle_request(request).await,
        Err(err) => {
            warn!(request_id = %request_id, "rejected malformed request");
            return with_headers(err.into_response(), &request_id, None, &state.key_header);
        }
    };

    let response = match result {
        Ok(outcome) => {
            info!(
                request_id = %request_id,
                key = %key,
                replayed = outcome.is_replay(),
                "request served"
            );
            outcome_response(outcome)
        }
        Err(err) => {
            info!(request_id = %request_id, key = %key, error = %err, "request not executed");
            WebError::from(err).into_response()
        }
    };

    with_headers(response, &request_id, Some(&key), &state.key_header)
}

fn parse_request(state: &AppState, headers: &HeaderMap, body: &Bytes) -> Result<IncomingRequest> {
    let header_key = idempotency_key_from_header(headers.get(&state.key_header))?;
    let payload = serde_json::from_slice::<Value>(body)
        .map_err(|err| WebError::input(format!("{}: {}", BODY_NOT_JSON_MESSAGE, err)))?;
    Ok(IncomingRequest {
        header_key,
        payload,
    })
}

fn outcome_response(outcome: Outcome) -> Response {
    let replayed = outcome.is_replay();
    let mut response = (StatusCode::OK, Json(outcome.body().clone())).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(IDEMPOTENCY_REPLAYED_HEADER),
        HeaderValue::from_static(if replayed { "true" } else { "false" }),
    );
    response
}

fn with_headers(
    mut response: Response,
    request_id: &str,
    key: Option<&str>,
    key_header: &HeaderName,
) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Some(value) = key.and_then(|k| HeaderValue::from_str(k).ok()) {
        headers.insert(key_header.clone(), value);
    }
    response
}
