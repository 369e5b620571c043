use super::{BackendResult, CasOutcome, KvBackend, PutOutcome};
use crate::core::{Clock, IdempotencyRecord, Revision, SystemClock};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Process-local backend with the same conditional semantics as the networked one.
///
/// Every conditional primitive runs under the write lock, so create-if-absent
/// and compare-and-swap are atomic. Expired items are invisible to reads and
/// writes; `sweep_expired` reclaims their memory.
pub struct InMemoryKvBackend {
    items: RwLock<HashMap<String, IdempotencyRecord>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryKvBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored items, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Physically removes expired items. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, record| !record.is_expired(now));
        let swept = before - items.len();
        if swept > 0 {
            debug!("Swept {} expired idempotency records", swept);
        }
        swept
    }

    /// Runs `sweep_expired` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        info!("Starting expiry sweeper every {:?}", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                backend.sweep_expired().await;
            }
        })
    }

    fn live<'a>(
        items: &'a HashMap<String, IdempotencyRecord>,
        key: &str,
        clock: &dyn Clock,
    ) -> Option<&'a IdempotencyRecord> {
        let now = clock.now();
        items.get(key).filter(|record| !record.is_expired(now))
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn get_item(&self, key: &str) -> BackendResult<Option<IdempotencyRecord>> {
        let items = self.items.read().await;
        Ok(Self::live(&items, key, self.clock.as_ref()).cloned())
    }

    async fn put_item_if_absent(&self, record: &IdempotencyRecord) -> BackendResult<PutOutcome> {
        let mut items = self.items.write().await;
        if Self::live(&items, &record.key, self.clock.as_ref()).is_some() {
            return Ok(PutOutcome::AlreadyExists);
        }

        items.insert(record.key.clone(), record.clone());
        Ok(PutOutcome::Created)
    }

    async fn update_item_if_version(
        &self,
        key: &str,
        expected: Revision<'_>,
        record: &IdempotencyRecord,
    ) -> BackendResult<CasOutcome> {
        let mut items = self.items.write().await;
        let matches = Self::live(&items, key, self.clock.as_ref())
            .is_some_and(|current| current.is_revision(expected));
        if !matches {
            return Ok(CasOutcome::VersionMismatch);
        }

        items.insert(key.to_string(), record.clone());
        Ok(CasOutcome::Updated)
    }

    async fn delete_item(
        &self,
        key: &str,
        expected: Option<Revision<'_>>,
    ) -> BackendResult<CasOutcome> {
        let mut items = self.items.write().await;
        let Some(expected) = expected else {
            items.remove(key);
            return Ok(CasOutcome::Updated);
        };

        let matches = Self::live(&items, key, self.clock.as_ref())
            .is_some_and(|current| current.is_revision(expected));
        if !matches {
            return Ok(CasOutcome::VersionMismatch);
        }

        items.remove(key);
        Ok(CasOutcome::Updated)
    }
}
