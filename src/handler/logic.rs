use super::{BusinessLogic, HandlerFailure};
use crate::core::ErrorInfo;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns the payload it was given. Used when no downstream is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoLogic;

#[async_trait]
impl BusinessLogic for EchoLogic {
    async fn execute(&self, payload: &Value) -> Result<Value, HandlerFailure> {
        Ok(json!({ "status": "ok", "echo": payload }))
    }
}

/// Forwards the payload to a downstream HTTP endpoint.
///
/// A non-2xx answer is a permanent failure and gets recorded. Transport
/// errors (refused connection, timeout) are transient.
#[derive(Debug, Clone)]
pub struct WebhookLogic {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookLogic {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BusinessLogic for WebhookLogic {
    async fn execute(&self, payload: &Value) -> Result<Value, HandlerFailure> {
        debug!(url = %self.url, "forwarding payload to webhook");

        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                HandlerFailure::transient(ErrorInfo::new(
                    502,
                    "upstream_unreachable",
                    format!("Webhook request failed: {}", e),
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(json!({ "status": "ok", "upstream_status": status.as_u16() }));
        }

        let body = response.text().await.unwrap_or_default();
        Err(HandlerFailure::permanent(
            ErrorInfo::new(
                424,
                "upstream_rejected",
                format!("Webhook answered {}", status),
            )
            .with_details(json!({ "upstream_status": status.as_u16(), "body": body })),
        ))
    }
}
