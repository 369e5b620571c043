//! Key-value backend adapters.
//!
//! The coordinator only ever talks to storage through [`KvBackend`], a narrow
//! set of primitives that a networked store with conditional writes and native
//! per-item expiry can provide atomically.

pub mod memory;
#[cfg(feature = "dynamodb")]
pub mod dynamodb;

use crate::core::{BackendError, IdempotencyRecord, Revision};
use async_trait::async_trait;

pub use memory::InMemoryKvBackend;
#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoDbConfig, DynamoDbKvBackend};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Updated,
    /// Stored revision differs, or the item is gone.
    VersionMismatch,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Strongly consistent point read. Expired items are reported as absent.
    async fn get_item(&self, key: &str) -> BackendResult<Option<IdempotencyRecord>>;

    /// Creates the item unless a live item already exists under its key.
    async fn put_item_if_absent(&self, record: &IdempotencyRecord) -> BackendResult<PutOutcome>;

    /// Replaces the item only if its stored version and claim id equal `expected`.
    async fn update_item_if_version(
        &self,
        key: &str,
        expected: Revision<'_>,
        record: &IdempotencyRecord,
    ) -> BackendResult<CasOutcome>;

    /// Deletes the item, optionally conditioned on its stored revision.
    async fn delete_item(&self, key: &str, expected: Option<Revision<'_>>)
    -> BackendResult<CasOutcome>;
}
