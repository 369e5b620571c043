//! TTL assignment and staleness thresholds.
//!
//! The policy is a pure function of record status and configuration. Two TTL
//! classes exist:
//! - the in-flight TTL bounds how long an IN_PROGRESS claim is trusted before
//!   another request may reclaim it. It must sit well above the slowest
//!   expected handler run, otherwise a live executor can be reclaimed.
//! - the terminal TTL is the retention window during which COMPLETED and
//!   FAILED outcomes are replayed instead of re-executed.

use crate::core::{IdempotencyRecord, RecordStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_IN_FLIGHT_TTL: Duration = Duration::from_secs(360);
pub const DEFAULT_TERMINAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Longest TTL either class accepts.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub in_flight_ttl: Duration,
    pub terminal_ttl: Duration,
    /// Upper bound for the backoff suggested to clients hitting an in-flight key.
    pub retry_after_hint: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            in_flight_ttl: DEFAULT_IN_FLIGHT_TTL,
            terminal_ttl: DEFAULT_TERMINAL_TTL,
            retry_after_hint: DEFAULT_RETRY_AFTER,
        }
    }
}

impl ExpiryPolicy {
    pub fn new(in_flight_ttl: Duration, terminal_ttl: Duration) -> Self {
        Self {
            in_flight_ttl,
            terminal_ttl,
            ..Self::default()
        }
    }

    pub fn retry_after_hint(mut self, hint: Duration) -> Self {
        self.retry_after_hint = hint;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.in_flight_ttl.is_zero() {
            return Err("in-flight TTL must be greater than zero".to_string());
        }
        if self.terminal_ttl.is_zero() {
            return Err("terminal TTL must be greater than zero".to_string());
        }
        if self.in_flight_ttl > MAX_TTL || self.terminal_ttl > MAX_TTL {
            return Err(format!("TTLs must not exceed {} seconds", MAX_TTL.as_secs()));
        }
        Ok(())
    }

    /// Returns `(in_progress_until, expires_at)` for a claim taken at `now`.
    ///
    /// The item outlives its staleness threshold by one more in-flight window,
    /// during which an abandoned claim is reclaimed by compare-and-swap. After
    /// that the backend forgets it and a plain conditional create takes over.
    pub fn in_flight_deadlines(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let in_progress_until = later_by(now, self.in_flight_ttl);
        (in_progress_until, later_by(in_progress_until, self.in_flight_ttl))
    }

    pub fn terminal_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        later_by(now, self.terminal_ttl)
    }

    pub fn is_stale(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> bool {
        match (record.status, record.in_progress_until) {
            (RecordStatus::InProgress, Some(until)) => until <= now,
            // A claim without a threshold can never be trusted as live.
            (RecordStatus::InProgress, None) => true,
            _ => false,
        }
    }

    /// Suggested client backoff for a live in-flight record.
    pub fn retry_after(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Duration {
        let remaining = record
            .in_progress_until
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or(MIN_RETRY_AFTER);

        remaining.min(self.retry_after_hint).max(MIN_RETRY_AFTER)
    }
}

/// Saturates at the last representable instant instead of overflowing.
fn later_by(instant: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
