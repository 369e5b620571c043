//! DynamoDB backend
//!
//! One item per idempotency key in a table with a string partition key `PK`
//! and native TTL enabled on the `TTL` attribute (epoch seconds). Native TTL
//! deletion is lazy, so every condition and read also checks `expires_at`
//! (epoch millis) against the adapter clock.

use super::{BackendResult, CasOutcome, KvBackend, PutOutcome};
use crate::core::{
    BackendError, Clock, ErrorInfo, IdempotencyRecord, RecordStatus, Revision, SystemClock,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const ATTR_PK: &str = "PK";
pub const ATTR_TTL: &str = "TTL";
pub const ATTR_FINGERPRINT: &str = "fingerprint";
pub const ATTR_CLAIM_ID: &str = "claim_id";
pub const ATTR_STATUS: &str = "status";
pub const ATTR_RESULT: &str = "result";
pub const ATTR_ERROR_INFO: &str = "error_info";
pub const ATTR_VERSION: &str = "version";
pub const ATTR_CREATED_AT: &str = "created_at";
pub const ATTR_IN_PROGRESS_UNTIL: &str = "in_progress_until";
pub const ATTR_EXPIRES_AT: &str = "expires_at";

const REVISION_CONDITION: &str = "#ver = :expected AND #claim = :claim AND #exp > :now";

/// DynamoDB backend configuration
#[derive(Debug, Clone)]
pub struct DynamoDbConfig {
    /// DynamoDB table name
    pub table_name: String,
    /// AWS region (optional, uses SDK default if not specified)
    pub region: Option<String>,
    /// Optional endpoint override (e.g. DynamoDB Local)
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct DynamoDbKvBackend {
    client: Client,
    table_name: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DynamoDbKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbKvBackend")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoDbKvBackend {
    /// Builds a client from the default AWS provider chain plus overrides.
    pub async fn connect(config: DynamoDbConfig) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::new(&sdk_config, config)
    }

    pub fn new(sdk_config: &aws_config::SdkConfig, config: DynamoDbConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        if let Some(region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self::from_client(Client::from_conf(builder.build()), config.table_name)
    }

    /// Create from a pre-built client (for testing)
    pub fn from_client(client: Client, table_name: String) -> Self {
        Self {
            client,
            table_name,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn now_millis(&self) -> String {
        self.clock.now().timestamp_millis().to_string()
    }

    fn record_to_item(record: &IdempotencyRecord) -> BackendResult<HashMap<String, AttributeValue>> {
        let mut item = HashMap::new();
        item.insert(ATTR_PK.to_string(), AttributeValue::S(record.key.clone()));
        item.insert(
            ATTR_TTL.to_string(),
            AttributeValue::N(record.expires_at.timestamp().to_string()),
        );
        item.insert(
            ATTR_FINGERPRINT.to_string(),
            AttributeValue::S(record.fingerprint.clone()),
        );
        item.insert(
            ATTR_CLAIM_ID.to_string(),
            AttributeValue::S(record.claim_id.clone()),
        );
        item.insert(
            ATTR_STATUS.to_string(),
            AttributeValue::S(record.status.as_str().to_string()),
        );
        item.insert(
            ATTR_VERSION.to_string(),
            AttributeValue::N(record.version.to_string()),
        );
        item.insert(
            ATTR_CREATED_AT.to_string(),
            AttributeValue::N(record.created_at.timestamp_millis().to_string()),
        );
        item.insert(
            ATTR_EXPIRES_AT.to_string(),
            AttributeValue::N(record.expires_at.timestamp_millis().to_string()),
        );

        if let Some(until) = record.in_progress_until {
            item.insert(
                ATTR_IN_PROGRESS_UNTIL.to_string(),
                AttributeValue::N(until.timestamp_millis().to_string()),
            );
        }
        if let Some(result) = &record.result {
            let encoded = serde_json::to_string(result)
                .map_err(|e| BackendError::Corrupt(format!("result encoding failed: {}", e)))?;
            item.insert(ATTR_RESULT.to_string(), AttributeValue::S(encoded));
        }
        if let Some(error_info) = &record.error_info {
            let encoded = serde_json::to_string(error_info)
                .map_err(|e| BackendError::Corrupt(format!("error_info encoding failed: {}", e)))?;
            item.insert(ATTR_ERROR_INFO.to_string(), AttributeValue::S(encoded));
        }

        Ok(item)
    }

    fn item_to_record(item: &HashMap<String, AttributeValue>) -> BackendResult<IdempotencyRecord> {
        let key = string_attr(item, ATTR_PK)?;
        let status = string_attr(item, ATTR_STATUS)?.parse::<RecordStatus>()?;

        let result = optional_string_attr(item, ATTR_RESULT)
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(|e| BackendError::Corrupt(format!("result for '{}': {}", key, e)))?;
        let error_info = optional_string_attr(item, ATTR_ERROR_INFO)
            .map(|raw| serde_json::from_str::<ErrorInfo>(&raw))
            .transpose()
            .map_err(|e| BackendError::Corrupt(format!("error_info for '{}': {}", key, e)))?;

        let in_progress_until = match item.get(ATTR_IN_PROGRESS_UNTIL) {
            Some(_) => Some(millis_attr(item, ATTR_IN_PROGRESS_UNTIL)?),
            None => None,
        };

        let record = IdempotencyRecord {
            fingerprint: string_attr(item, ATTR_FINGERPRINT)?,
            claim_id: string_attr(item, ATTR_CLAIM_ID)?,
            status,
            result,
            error_info,
            version: number_attr(item, ATTR_VERSION)?,
            created_at: millis_attr(item, ATTR_CREATED_AT)?,
            in_progress_until,
            expires_at: millis_attr(item, ATTR_EXPIRES_AT)?,
            key,
        };
        record.validate()?;
        Ok(record)
    }

    fn is_condition_failure<E>(err: &SdkError<E>, check: impl Fn(&E) -> bool) -> bool {
        match err {
            SdkError::ServiceError(service_err) => check(service_err.err()),
            _ => false,
        }
    }
}

#[async_trait]
impl KvBackend for DynamoDbKvBackend {
    async fn get_item(&self, key: &str) -> BackendResult<Option<IdempotencyRecord>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_PK, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("DynamoDB GetItem failed: {}", e)))?;

        let Some(item) = response.item() else {
            return Ok(None);
        };

        let record = Self::item_to_record(item)?;
        if record.is_expired(self.clock.now()) {
            debug!("Item '{}' is past expiry, awaiting native TTL deletion", key);
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn put_item_if_absent(&self, record: &IdempotencyRecord) -> BackendResult<PutOutcome> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::record_to_item(record)?))
            .condition_expression("attribute_not_exists(#pk) OR #exp <= :now")
            .expression_attribute_names("#pk", ATTR_PK)
            .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
            .expression_attribute_values(":now", AttributeValue::N(self.now_millis()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Created),
            Err(e) if Self::is_condition_failure(&e, |err| {
                err.is_conditional_check_failed_exception()
            }) =>
            {
                Ok(PutOutcome::AlreadyExists)
            }
            Err(e) => Err(BackendError::Unavailable(format!(
                "DynamoDB PutItem failed: {}",
                e
            ))),
        }
    }

    async fn update_item_if_version(
        &self,
        key: &str,
        expected: Revision<'_>,
        record: &IdempotencyRecord,
    ) -> BackendResult<CasOutcome> {
        if record.key != key {
            return Err(BackendError::Corrupt(format!(
                "record key '{}' does not match target key '{}'",
                record.key, key
            )));
        }

        // Full replacement guarded by version and claim id; an absent item
        // fails the comparison.
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::record_to_item(record)?))
            .condition_expression(REVISION_CONDITION)
            .expression_attribute_names("#ver", ATTR_VERSION)
            .expression_attribute_names("#claim", ATTR_CLAIM_ID)
            .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
            .expression_attribute_values(":expected", AttributeValue::N(expected.version.to_string()))
            .expression_attribute_values(":claim", AttributeValue::S(expected.claim_id.to_string()))
            .expression_attribute_values(":now", AttributeValue::N(self.now_millis()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(CasOutcome::Updated),
            Err(e) if Self::is_condition_failure(&e, |err| {
                err.is_conditional_check_failed_exception()
            }) =>
            {
                Ok(CasOutcome::VersionMismatch)
            }
            Err(e) => Err(BackendError::Unavailable(format!(
                "DynamoDB PutItem (versioned) failed: {}",
                e
            ))),
        }
    }

    async fn delete_item(
        &self,
        key: &str,
        expected: Option<Revision<'_>>,
    ) -> BackendResult<CasOutcome> {
        let mut request = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(ATTR_PK, AttributeValue::S(key.to_string()));

        if let Some(expected) = expected {
            request = request
                .condition_expression(REVISION_CONDITION)
                .expression_attribute_names("#ver", ATTR_VERSION)
                .expression_attribute_names("#claim", ATTR_CLAIM_ID)
                .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
                .expression_attribute_values(":expected", AttributeValue::N(expected.version.to_string()))
                .expression_attribute_values(":claim", AttributeValue::S(expected.claim_id.to_string()))
                .expression_attribute_values(":now", AttributeValue::N(self.now_millis()));
        }

        match request.send().await {
            Ok(_) => Ok(CasOutcome::Updated),
            Err(e) if Self::is_condition_failure(&e, |err| {
                err.is_conditional_check_failed_exception()
            }) =>
            {
                warn!("Conditional delete of '{}' lost to a concurrent writer", key);
                Ok(CasOutcome::VersionMismatch)
            }
            Err(e) => Err(BackendError::Unavailable(format!(
                "DynamoDB DeleteItem failed: {}",
                e
            ))),
        }
    }
}

fn optional_string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> BackendResult<String> {
    optional_string_attr(item, name)
        .ok_or_else(|| BackendError::Corrupt(format!("missing string attribute '{}'", name)))
}

fn number_attr<T: std::str::FromStr>(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> BackendResult<T> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|raw| raw.parse::<T>().ok())
        .ok_or_else(|| BackendError::Corrupt(format!("missing numeric attribute '{}'", name)))
}

fn millis_attr(item: &HashMap<String, AttributeValue>, name: &str) -> BackendResult<DateTime<Utc>> {
    let millis = number_attr::<i64>(item, name)?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| BackendError::Corrupt(format!("timestamp '{}' out of range", name)))
}
