use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes, to_bytes},
    http::{Method, Request, StatusCode, header::HeaderMap},
};
use idemstore::storage::BackendResult;
use idemstore::{
    AppState, BackendError, BusinessLogic, CasOutcome, Coordinator, EchoLogic, ErrorInfo,
    ExpiryPolicy, HandlerFailure, IdempotencyRecord, IdempotentHandler, InMemoryKvBackend,
    KvBackend, PutOutcome, Revision, SystemClock, WebhookLogic, build_router,
};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app_with(backend: Arc<dyn KvBackend>, logic: Arc<dyn BusinessLogic>) -> axum::Router {
    let coordinator = Coordinator::new(backend, ExpiryPolicy::default(), Arc::new(SystemClock));
    let handler = IdempotentHandler::new(coordinator, logic).key_field(Some("/name".to_string()));
    build_router(AppState::new(Arc::new(handler)))
}

fn app() -> axum::Router {
    app_with(Arc::new(InMemoryKvBackend::new()), Arc::new(EchoLogic))
}

async fn post(
    app: &axum::Router,
    key: Option<&str>,
    body: impl Into<Body>,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("content-type", "application/json");
    if let Some(key) = key {
        request = request.header("Idempotency-Key", key);
    }
    let request = request.body(body.into()).expect("request should build");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("response expected");
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    (status, headers, body)
}

fn json_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).expect("body should be valid JSON")
}

#[tokio::test]
async fn health_endpoint_responds() {
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .expect("request should build");
    let response = app().oneshot(request).await.expect("response expected");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn replay_returns_identical_bytes() {
    let app = app();

    let (status, headers, first) = post(&app, Some("req-1"), r#"{"name":"test"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["idempotency-replayed"], "false");
    assert_eq!(headers["idempotency-key"], "req-1");
    assert_eq!(
        json_body(&first),
        json!({"status": "ok", "echo": {"name": "test"}})
    );

    let (status, headers, second) = post(&app, Some("req-1"), r#"{ "name" : "test" }"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["idempotency-replayed"], "true");
    assert_eq!(first, second);
}

#[tokio::test]
async fn key_falls_back_to_payload_field() {
    let app = app();

    let (_, headers, _) = post(&app, None, r#"{"name":"test"}"#).await;
    assert_eq!(headers["idempotency-key"], "test");

    let (_, headers, _) = post(&app, None, r#"{"name":"test"}"#).await;
    assert_eq!(headers["idempotency-replayed"], "true");
}

#[tokio::test]
async fn reused_key_with_different_body_is_unprocessable() {
    let app = app();
    post(&app, Some("abc"), r#"{"name":"one"}"#).await;

    let (status, _, body) = post(&app, Some("abc"), r#"{"name":"two"}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(&body)["code"], "idempotency_key_reused");
}

#[tokio::test]
async fn malformed_input_is_rejected() {
    let app = app();

    let (status, headers, body) = post(&app, Some("k"), "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = json_body(&body);
    assert_eq!(body["code"], "input_error");
    assert!(body["error"].as_str().unwrap().starts_with("Request body must be valid JSON: "));
    assert!(headers.contains_key("x-request-id"));

    let too_long = "k".repeat(129);
    let (status, _, _) = post(&app, Some(&too_long), r#"{}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_id_is_echoed() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("x-request-id", "trace-42")
        .body(Body::from(r#"{"name":"x"}"#))
        .expect("request should build");
    let response = app().oneshot(request).await.expect("response expected");
    assert_eq!(response.headers()["x-request-id"], "trace-42");
}

struct Rejecting;

#[async_trait]
impl BusinessLogic for Rejecting {
    async fn execute(&self, _payload: &Value) -> Result<Value, HandlerFailure> {
        Err(HandlerFailure::permanent(ErrorInfo::new(
            424,
            "upstream_rejected",
            "Webhook answered 400 Bad Request",
        )))
    }
}

#[tokio::test]
async fn handler_failure_is_recorded_and_replayed() {
    let app = app_with(Arc::new(InMemoryKvBackend::new()), Arc::new(Rejecting));

    let (status, _, first) = post(&app, Some("xyz"), r#"{"name":"x"}"#).await;
    assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(json_body(&first)["code"], "upstream_rejected");

    let (status, _, second) = post(&app, Some("xyz"), r#"{"name":"x"}"#).await;
    assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(first, second);
}

#[tokio::test]
async fn unreachable_webhook_failure_is_replayed_as_client_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let webhook = WebhookLogic::new(format!("http://{}/hook", addr))
        .timeout(std::time::Duration::from_secs(2));
    let app = app_with(Arc::new(InMemoryKvBackend::new()), Arc::new(webhook));

    let (status, _, first) = post(&app, Some("k"), r#"{"name":"x"}"#).await;
    assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(json_body(&first)["code"], "upstream_unreachable");

    let (status, _, second) = post(&app, Some("k"), r#"{"name":"x"}"#).await;
    assert!(status.is_client_error());
    assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(first, second);
}

#[tokio::test]
async fn in_flight_duplicate_gets_conflict_with_retry_after() {
    let backend = Arc::new(InMemoryKvBackend::new());
    let app = app_with(backend.clone(), Arc::new(EchoLogic));

    let coordinator = Coordinator::new(backend, ExpiryPolicy::default(), Arc::new(SystemClock));
    let fingerprint = idemstore::fingerprint::fingerprint(&json!({"name": "slow"}));
    coordinator.admit("busy", &fingerprint).await.unwrap();

    let (status, headers, body) = post(&app, Some("busy"), r#"{"name":"slow"}"#).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(headers["retry-after"], "2");
    assert_eq!(json_body(&body)["code"], "request_in_flight");
}

struct DownBackend;

#[async_trait]
impl KvBackend for DownBackend {
    async fn get_item(&self, _key: &str) -> BackendResult<Option<IdempotencyRecord>> {
        Err(BackendError::Unavailable("timeout".to_string()))
    }

    async fn put_item_if_absent(&self, _record: &IdempotencyRecord) -> BackendResult<PutOutcome> {
        Err(BackendError::Unavailable("timeout".to_string()))
    }

    async fn update_item_if_version(
        &self,
        _key: &str,
        _expected: Revision<'_>,
        _record: &IdempotencyRecord,
    ) -> BackendResult<CasOutcome> {
        Err(BackendError::Unavailable("timeout".to_string()))
    }

    async fn delete_item(
        &self,
        _key: &str,
        _expected: Option<Revision<'_>>,
    ) -> BackendResult<CasOutcome> {
        Err(BackendError::Unavailable("timeout".to_string()))
    }
}

#[tokio::test]
async fn backend_outage_is_service_unavailable() {
    let app = app_with(Arc::new(DownBackend), Arc::new(EchoLogic));

    let (status, headers, body) = post(&app, Some("k"), r#"{"name":"x"}"#).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.contains_key("retry-after"));
    assert_eq!(json_body(&body)["code"], "backend_unavailable");
}
