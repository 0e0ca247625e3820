use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use publisher::config::{LogFormat, PublisherConfig};
use publisher::publish::api::AppState;
use publisher::publish::backend::DeploymentBackend;
use publisher::publish::orchestrator::PublishOrchestrator;
use publisher::publish::server;
use publisher::publish::store;
use publisher::publish::supervisor::ProcessSupervisor;

const DEFAULT_LOG_FILTER: &str = "publisher=info,tower_http=info";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal in production.
    let _ = dotenvy::dotenv();

    let config = PublisherConfig::parse();
    init_tracing(config.log_format);
    config.validate().context("Invalid configuration")?;

    let store = store::connect(&config.database_url)
        .await
        .context("Failed to connect to the project database")?;

    let supervisor = ProcessSupervisor::new();
    let backend = DeploymentBackend::from_config(&config, supervisor)
        .context("Failed to initialize deployment backend")?;
    tracing::info!(
        backend = backend.kind().as_str(),
        total_steps = backend.total_steps(),
        "deployment backend ready"
    );

    let orchestrator = PublishOrchestrator::new(
        store,
        backend,
        config.auth_token.clone(),
        &config.polling,
    );
    let state = Arc::new(AppState { orchestrator });

    server::start_server(&config.listen_addr(), state).await
}
