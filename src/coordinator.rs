//! Admission and completion protocol for idempotency keys.
//!
//! The coordinator keeps no state between calls and holds no in-process lock:
//! every race between duplicate requests is settled by the backend's
//! conditional create and compare-and-swap. Any number of coordinators, in any
//! number of processes, may share one backend.
//!
//! Crash recovery is by reclamation only. A claim whose holder died stays
//! IN_PROGRESS until its staleness threshold passes, then the next `admit`
//! takes it over. If the original holder was merely slow, the business logic
//! runs twice; the slow holder then gets `StaleWrite` from `complete`/`fail`
//! and the reclaiming holder's outcome is the one replayed.

use crate::core::{Clock, ErrorInfo, IdempotencyError, IdempotencyRecord, RecordStatus, Result};
use crate::policy::ExpiryPolicy;
use crate::storage::{CasOutcome, KvBackend, PutOutcome};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Permission to execute, returned with `Decision::Proceed`.
///
/// Carries the claimed record so `complete`/`fail` can write the terminal
/// state conditioned on the version observed at admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    record: IdempotencyRecord,
}

impl Claim {
    pub fn key(&self) -> &str {
        &self.record.key
    }

    /// Version the terminal write is conditioned on, together with the claim id.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.fingerprint
    }

    pub fn claim_id(&self) -> &str {
        &self.record.claim_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The caller is the sole executor for this key.
    Proceed(Claim),
    /// Completed earlier: return the stored result.
    Replay(Value),
    /// Failed earlier: return the stored failure.
    ReplayError(ErrorInfo),
    /// Another executor holds a live claim. Retry after the hinted delay.
    InFlight { retry_after: Duration },
    /// Key already used for a different payload.
    Conflict,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Proceed(_) => "proceed",
            Self::Replay(_) => "replay",
            Self::ReplayError(_) => "replay_error",
            Self::InFlight { .. } => "in_flight",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn KvBackend>,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn KvBackend>, policy: ExpiryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &ExpiryPolicy {
        &self.policy
    }

    /// Decides what the caller should do with a request.
    ///
    /// Fingerprint equality is checked before status, so a different payload is
    /// reported as `Conflict` even when the stored claim is abandoned.
    pub async fn admit(&self, key: &str, fingerprint: &str) -> Result<Decision> {
        let now = self.clock.now();
        let (in_progress_until, expires_at) = self.policy.in_flight_deadlines(now);
        let claim = IdempotencyRecord::in_progress(key, fingerprint, now, in_progress_until, expires_at);

        // The second pass covers an item that expired between the failed
        // create and the read.
        for _ in 0..2 {
            if self.backend.put_item_if_absent(&claim).await? == PutOutcome::Created {
                info!(key, decision = "proceed", version = 0, "claimed new idempotency key");
                return Ok(Decision::Proceed(Claim { record: claim }));
            }

            if let Some(existing) = self.backend.get_item(key).await? {
                let decision = self.decide_existing(existing, fingerprint).await?;
                debug!(key, decision = decision.label(), "idempotency key already known");
                return Ok(decision);
            }
        }

        warn!(key, "idempotency key kept changing hands during admission");
        Ok(Decision::InFlight {
            retry_after: self.policy.retry_after_hint,
        })
    }

    async fn decide_existing(
        &self,
        existing: IdempotencyRecord,
        fingerprint: &str,
    ) -> Result<Decision> {
        if !existing.fingerprint_matches(fingerprint) {
            return Ok(Decision::Conflict);
        }

        match existing.status {
            RecordStatus::Completed => existing.result.map(Decision::Replay).ok_or_else(|| {
                IdempotencyError::Corrupt(format!("completed record '{}' has no result", existing.key))
            }),
            RecordStatus::Failed => existing.error_info.map(Decision::ReplayError).ok_or_else(|| {
                IdempotencyError::Corrupt(format!("failed record '{}' has no error info", existing.key))
            }),
            RecordStatus::InProgress => {
                let now = self.clock.now();
                if self.policy.is_stale(&existing, now) {
                    self.reclaim(existing).await
                } else {
                    Ok(Decision::InFlight {
                        retry_after: self.policy.retry_after(&existing, now),
                    })
                }
            }
        }
    }

    async fn reclaim(&self, abandoned: IdempotencyRecord) -> Result<Decision> {
        let (in_progress_until, expires_at) = self.policy.in_flight_deadlines(self.clock.now());
        let fresh = abandoned.reclaimed(in_progress_until, expires_at);

        match self
            .backend
            .update_item_if_version(&abandoned.key, abandoned.revision(), &fresh)
            .await?
        {
            CasOutcome::Updated => {
                warn!(
                    key = %fresh.key,
                    version = fresh.version,
                    "reclaimed abandoned in-progress claim"
                );
                Ok(Decision::Proceed(Claim { record: fresh }))
            }
            CasOutcome::VersionMismatch => Ok(Decision::InFlight {
                retry_after: self.policy.retry_after_hint,
            }),
        }
    }

    /// Records the handler result for the claimed key.
    pub async fn complete(&self, claim: &Claim, result: Value) -> Result<()> {
        let done = claim
            .record
            .completed(result, self.policy.terminal_expiry(self.clock.now()));
        self.write_terminal(claim, &done).await
    }

    /// Records the handler failure for the claimed key.
    ///
    /// Replayed failures must stay client errors, so a status outside 4xx is
    /// stored as `424 Failed Dependency`. Returns the failure as recorded.
    pub async fn fail(&self, claim: &Claim, error_info: ErrorInfo) -> Result<ErrorInfo> {
        let error_info = error_info.into_client_error();
        let failed = claim
            .record
            .failed(error_info.clone(), self.policy.terminal_expiry(self.clock.now()));
        self.write_terminal(claim, &failed).await?;
        Ok(error_info)
    }

    async fn write_terminal(&self, claim: &Claim, record: &IdempotencyRecord) -> Result<()> {
        match self
            .backend
            .update_item_if_version(claim.key(), claim.record.revision(), record)
            .await?
        {
            CasOutcome::Updated => {
                info!(
                    key = claim.key(),
                    status = %record.status,
                    version = record.version,
                    "recorded terminal outcome"
                );
                Ok(())
            }
            CasOutcome::VersionMismatch => {
                warn!(
                    key = claim.key(),
                    expected_version = claim.version(),
                    "claim lost before outcome could be recorded"
                );
                Err(IdempotencyError::StaleWrite {
                    key: claim.key().to_string(),
                    expected_version: claim.version(),
                })
            }
        }
    }

    /// Drops the caller's own claim so a retry executes again.
    ///
    /// Returns `false` when the claim had already been taken over.
    pub async fn release(&self, claim: &Claim) -> Result<bool> {
        let outcome = self
            .backend
            .delete_item(claim.key(), Some(claim.record.revision()))
            .await?;
        debug!(key = claim.key(), released = outcome == CasOutcome::Updated, "released claim");
        Ok(outcome == CasOutcome::Updated)
    }

    /// Deletes an IN_PROGRESS record that is past its staleness threshold.
    pub async fn purge_abandoned(&self, key: &str) -> Result<bool> {
        let Some(record) = self.backend.get_item(key).await? else {
            return Ok(false);
        };
        if !self.policy.is_stale(&record, self.clock.now()) {
            return Ok(false);
        }

        let outcome = self.backend.delete_item(key, Some(record.revision())).await?;
        if outcome == CasOutcome::Updated {
            info!(key, version = record.version, "purged abandoned claim");
        }
        Ok(outcome == CasOutcome::Updated)
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.backend.get_item(key).await?)
    }
}
