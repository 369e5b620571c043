use super::error::BackendError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

impl RecordStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = BackendError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(BackendError::Corrupt(format!("unknown status '{other}'"))),
        }
    }
}

/// Status recorded for failures whose own status is not a client error.
pub const FAILED_DEPENDENCY: u16 = 424;

/// Serialized failure detail stored on FAILED records and replayed to duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// HTTP status returned for this failure.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Same failure with its status forced into the 4xx class.
    pub fn into_client_error(mut self) -> Self {
        if !(400..500).contains(&self.status) {
            self.status = FAILED_DEPENDENCY;
        }
        self
    }
}

/// Precondition of a conditional write.
///
/// The version alone repeats once an expired key is created again at
/// version 0, so the claim id is compared too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision<'a> {
    pub version: u64,
    pub claim_id: &'a str,
}

/// One tracked request, keyed by its idempotency key.
///
/// Records are only built through the transition constructors below so that
/// `result` and `error_info` stay mutually exclusive and each transition bumps
/// `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    /// Fresh for every claim, kept through the terminal transition.
    pub claim_id: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Staleness threshold of an IN_PROGRESS claim; `None` once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// First claim on a key.
    pub fn in_progress(
        key: impl Into<String>,
        fingerprint: impl Into<String>,
        now: DateTime<Utc>,
        in_progress_until: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            fingerprint: fingerprint.into(),
            claim_id: Uuid::new_v4().to_string(),
            status: RecordStatus::InProgress,
            result: None,
            error_info: None,
            version: 0,
            created_at: now,
            in_progress_until: Some(in_progress_until),
            expires_at,
        }
    }

    /// Fresh claim over an abandoned IN_PROGRESS record.
    pub fn reclaimed(&self, in_progress_until: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            claim_id: Uuid::new_v4().to_string(),
            status: RecordStatus::InProgress,
            result: None,
            error_info: None,
            version: self.version + 1,
            in_progress_until: Some(in_progress_until),
            expires_at,
            ..self.clone()
        }
    }

    pub fn completed(&self, result: Value, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Completed,
            result: Some(result),
            error_info: None,
            version: self.version + 1,
            in_progress_until: None,
            expires_at,
            ..self.clone()
        }
    }

    pub fn failed(&self, error_info: ErrorInfo, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Failed,
            result: None,
            error_info: Some(error_info),
            version: self.version + 1,
            in_progress_until: None,
            expires_at,
            ..self.clone()
        }
    }

    pub fn revision(&self) -> Revision<'_> {
        Revision {
            version: self.version,
            claim_id: &self.claim_id,
        }
    }

    /// Whether this is the exact stored state a conditional write expects.
    pub fn is_revision(&self, expected: Revision<'_>) -> bool {
        self.version == expected.version && self.claim_id == expected.claim_id
    }

    pub fn fingerprint_matches(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }

    /// Past `expires_at`: the backend treats the item as deleted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Checks the per-status shape of a record read back from storage.
    pub fn validate(&self) -> Result<(), BackendError> {
        let ok = match self.status {
            RecordStatus::InProgress => {
                self.result.is_none() && self.error_info.is_none() && self.in_progress_until.is_some()
            }
            RecordStatus::Completed => self.result.is_some() && self.error_info.is_none(),
            RecordStatus::Failed => self.result.is_none() && self.error_info.is_some(),
        };

        if ok {
            Ok(())
        } else {
            Err(BackendError::Corrupt(format!(
                "record '{}' has an invalid shape for status {}",
                self.key, self.status
            )))
        }
    }
}
