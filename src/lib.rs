//! Idempotency-key store and the coordination protocol around it.
//!
//! Duplicate submissions of a logical request (client retries, redelivery)
//! run the wrapped business logic at most once; every duplicate gets the
//! recorded outcome back. All races are settled by conditional writes in a
//! shared key-value backend, never by in-process locks.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod fingerprint;
pub mod handler;
pub mod policy;
pub mod storage;
pub mod web;

pub use coordinator::{Claim, Coordinator, Decision};
pub use core::{
    BackendError, Clock, ErrorInfo, IdempotencyError, IdempotencyRecord, ManualClock,
    RecordStatus, Result, Revision, SystemClock,
};
pub use handler::{
    BusinessLogic, EchoLogic, HandlerFailure, IdempotentHandler, IncomingRequest, Outcome,
    WebhookLogic,
};
pub use policy::ExpiryPolicy;
pub use storage::{CasOutcome, InMemoryKvBackend, KvBackend, PutOutcome};
pub use web::{AppState, build_router};
