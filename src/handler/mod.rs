//! Handler adapter: runs business logic only when the coordinator allows it.

pub mod logic;

use crate::coordinator::{Coordinator, Decision};
use crate::core::{ErrorInfo, IdempotencyError, Result};
use crate::fingerprint;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub use logic::{EchoLogic, WebhookLogic};

/// Business logic failure.
///
/// `transient` marks failures that may succeed on a plain retry (e.g. an
/// unreachable downstream); they are still recorded unless the adapter is
/// configured to release the claim instead. Recorded failures are answered
/// with a 4xx status, see [`Coordinator::fail`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub info: ErrorInfo,
    pub transient: bool,
}

impl HandlerFailure {
    pub fn permanent(info: ErrorInfo) -> Self {
        Self {
            info,
            transient: false,
        }
    }

    pub fn transient(info: ErrorInfo) -> Self {
        Self {
            info,
            transient: true,
        }
    }
}

/// The caller's business logic, wrapped by [`IdempotentHandler`].
#[async_trait]
pub trait BusinessLogic: Send + Sync {
    async fn execute(&self, payload: &Value) -> std::result::Result<Value, HandlerFailure>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Business logic ran in this request.
    Executed(Value),
    /// Stored result of an earlier execution.
    Replayed(Value),
}

impl Outcome {
    pub fn body(&self) -> &Value {
        match self {
            Self::Executed(body) | Self::Replayed(body) => body,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Inbound request as seen by the adapter.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Normalized idempotency key header, if the client sent one.
    pub header_key: Option<String>,
    pub payload: Value,
}

pub struct IdempotentHandler {
    coordinator: Coordinator,
    logic: Arc<dyn BusinessLogic>,
    key_field: Option<String>,
    release_on_transient_failure: bool,
}

impl IdempotentHandler {
    pub fn new(coordinator: Coordinator, logic: Arc<dyn BusinessLogic>) -> Self {
        Self {
            coordinator,
            logic,
            key_field: None,
            release_on_transient_failure: false,
        }
    }

    /// JSON pointer of a payload field used as key when no header is sent.
    pub fn key_field(mut self, pointer: Option<String>) -> Self {
        self.key_field = pointer;
        self
    }

    pub fn release_on_transient_failure(mut self, enabled: bool) -> Self {
        self.release_on_transient_failure = enabled;
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Computes key and fingerprint for `request`, then runs it through [`Self::handle`].
    ///
    /// The derived key is returned alongside the result, success or not.
    pub async fn handle_request(&self, request: IncomingRequest) -> (String, Result<Outcome>) {
        let fingerprint = fingerprint::fingerprint(&request.payload);
        let key = fingerprint::derive_key(
            request.header_key,
            &request.payload,
            self.key_field.as_deref(),
            &fingerprint,
        );
        let result = self.handle(&key, &fingerprint, &request.payload).await;
        (key, result)
    }

    /// Runs `payload` under `key`, executing business logic at most once per key.
    pub async fn handle(&self, key: &str, fingerprint: &str, payload: &Value) -> Result<Outcome> {
        let claim = match self.coordinator.admit(key, fingerprint).await? {
            Decision::Proceed(claim) => claim,
            Decision::Replay(result) => return Ok(Outcome::Replayed(result)),
            Decision::ReplayError(info) => return Err(IdempotencyError::HandlerExecution(info)),
            Decision::InFlight { retry_after } => {
                return Err(IdempotencyError::InFlight {
                    key: key.to_string(),
                    retry_after,
                });
            }
            Decision::Conflict => {
                return Err(IdempotencyError::Conflict {
                    key: key.to_string(),
                });
            }
        };

        match self.logic.execute(payload).await {
            Ok(result) => {
                self.coordinator.complete(&claim, result.clone()).await?;
                Ok(Outcome::Executed(result))
            }
            Err(failure) if failure.transient && self.release_on_transient_failure => {
                warn!(key, code = %failure.info.code, "transient handler failure, releasing claim");
                self.coordinator.release(&claim).await?;
                Err(IdempotencyError::HandlerExecution(failure.info))
            }
            Err(failure) => {
                info!(key, code = %failure.info.code, "handler failed, recording failure");
                let recorded = self.coordinator.fail(&claim, failure.info).await?;
                Err(IdempotencyError::HandlerExecution(recorded))
            }
        }
    }
}
