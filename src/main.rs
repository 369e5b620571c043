use std::sync::Arc;

use anyhow::{Context, Result};
use idemstore::{
    AppState, BusinessLogic, Coordinator, EchoLogic, IdempotentHandler, InMemoryKvBackend,
    KvBackend, SystemClock, WebhookLogic, build_router,
    config::{AppConfig, BackendKind},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("failed to load application configuration")?;
    init_tracing(&config.log_filter)?;

    let mut sweeper = None;
    let backend: Arc<dyn KvBackend> = match config.backend {
        BackendKind::Memory => {
            info!("idempotency backend: memory");
            let memory = Arc::new(InMemoryKvBackend::new());
            sweeper = Some(memory.spawn_sweeper(config.sweep_interval));
            memory
        }
        BackendKind::DynamoDb => connect_dynamodb(&config).await?,
    };

    let logic: Arc<dyn BusinessLogic> = match &config.webhook_url {
        Some(url) => {
            info!(url = %url, "business logic: webhook");
            Arc::new(WebhookLogic::new(url.clone()))
        }
        None => {
            info!("business logic: echo");
            Arc::new(EchoLogic)
        }
    };

    let coordinator = Coordinator::new(backend, config.policy, Arc::new(SystemClock));
    let handler = IdempotentHandler::new(coordinator, logic)
        .key_field(config.key_field.clone())
        .release_on_transient_failure(config.release_on_transient_failure);

    let app = build_router(
        AppState::new(Arc::new(handler)).key_header(config.idempotency_header.clone()),
    );

    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(
        address = %addr,
        in_flight_ttl_secs = config.policy.in_flight_ttl.as_secs(),
        terminal_ttl_secs = config.policy.terminal_ttl.as_secs(),
        "idempotency service started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = shutdown_signal().await;
            info!(signal, "draining in-flight requests");
        })
        .await
        .context("server error")?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("idempotency service stopped");

    Ok(())
}

#[cfg(feature = "dynamodb")]
async fn connect_dynamodb(config: &AppConfig) -> Result<Arc<dyn KvBackend>> {
    use idemstore::storage::{DynamoDbConfig, DynamoDbKvBackend};

    let table_name = config
        .table_name
        .clone()
        .context("TABLE_NAME is required for the dynamodb backend")?;
    info!(table = %table_name, "idempotency backend: dynamodb");

    let backend = DynamoDbKvBackend::connect(DynamoDbConfig {
        table_name,
        region: config.aws_region.clone(),
        endpoint: config.dynamodb_endpoint.clone(),
    })
    .await;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "dynamodb"))]
async fn connect_dynamodb(_config: &AppConfig) -> Result<Arc<dyn KvBackend>> {
    anyhow::bail!("IDEMPOTENCY_BACKEND=dynamodb requires building with `--features dynamodb`")
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log filter '{}'", filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(anyhow::Error::msg)
}

/// Resolves with the name of the signal that asked the server to stop.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable, stopping on Ctrl+C only");
                ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
