use crate::policy::{DEFAULT_IN_FLIGHT_TTL, DEFAULT_RETRY_AFTER, DEFAULT_TERMINAL_TTL, ExpiryPolicy};
use crate::web::app::DEFAULT_IDEMPOTENCY_HEADER;
use anyhow::{Context, Result};
use http::HeaderName;
use std::env;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LOG_FILTER: &str = "idemstore=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    DynamoDb,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "memory" | "mem" | "in-memory" => Ok(Self::Memory),
            "dynamodb" | "dynamo" | "ddb" => Ok(Self::DynamoDb),
            _ => Err(anyhow::anyhow!(
                "IDEMPOTENCY_BACKEND must be one of: memory, dynamodb"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub table_name: Option<String>,
    pub dynamodb_endpoint: Option<String>,
    pub aws_region: Option<String>,
    pub policy: ExpiryPolicy,
    pub idempotency_header: HeaderName,
    pub key_field: Option<String>,
    pub webhook_url: Option<String>,
    pub release_on_transient_failure: bool,
    pub sweep_interval: Duration,
    /// `tracing_subscriber::EnvFilter` directives.
    pub log_filter: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let host = var("APP_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = var("APP_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse::<u16>()
            .context("APP_PORT must be a valid u16")?;

        let backend = BackendKind::parse(&var("IDEMPOTENCY_BACKEND").unwrap_or_else(|| "memory".to_string()))?;

        let table_name = var("TABLE_NAME");
        if backend == BackendKind::DynamoDb && table_name.is_none() {
            anyhow::bail!("TABLE_NAME is required when IDEMPOTENCY_BACKEND=dynamodb");
        }

        let in_flight_ttl = secs(&var, "IN_FLIGHT_TTL_SECS", DEFAULT_IN_FLIGHT_TTL)?;
        let terminal_ttl = secs(&var, "TERMINAL_TTL_SECS", DEFAULT_TERMINAL_TTL)?;
        let retry_after = secs(&var, "RETRY_AFTER_SECS", DEFAULT_RETRY_AFTER)?;
        let policy = ExpiryPolicy::new(in_flight_ttl, terminal_ttl).retry_after_hint(retry_after);
        policy.validate().map_err(anyhow::Error::msg)?;

        let idempotency_header = var("IDEMPOTENCY_HEADER")
            .unwrap_or_else(|| DEFAULT_IDEMPOTENCY_HEADER.to_string());
        let idempotency_header = HeaderName::from_bytes(idempotency_header.trim().as_bytes())
            .with_context(|| format!("IDEMPOTENCY_HEADER '{}' is not a valid header name", idempotency_header))?;

        let key_field = var("KEY_FIELD").map(|field| {
            if field.starts_with('/') {
                field
            } else {
                format!("/{}", field)
            }
        });

        let release_on_transient_failure = var("RELEASE_ON_TRANSIENT_FAILURE")
            .map(|raw| raw.parse::<bool>())
            .transpose()
            .context("RELEASE_ON_TRANSIENT_FAILURE must be true or false")?
            .unwrap_or(false);

        let sweep_interval = secs(&var, "SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL)?;
        if sweep_interval.is_zero() {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than zero");
        }

        let log_filter = var("LOG_FILTER")
            .or_else(|| var("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            host,
            port,
            backend,
            table_name,
            dynamodb_endpoint: var("DYNAMODB_ENDPOINT"),
            aws_region: var("AWS_REGION"),
            policy,
            idempotency_header,
            key_field,
            webhook_url: var("WEBHOOK_URL"),
            release_on_transient_failure,
            sweep_interval,
            log_filter,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn secs<F>(var: &F, name: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("{} must be a whole number of seconds", name)),
        None => Ok(default),
    }
}
