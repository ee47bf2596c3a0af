mod bootstrap;
mod health;
mod services;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use ekko_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use ekko_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let keep_alive = health::spawn(
        &app.config.server.bind_address,
        app.config.server.keep_alive_port,
        health::HealthState::new(app.db_pool.clone(), Arc::clone(&app.orchestrator)),
    )
    .await?;

    tracing::info!(
        event_name = "system.server.gateway_transport_mode",
        transport_mode = app.transport_mode,
        correlation_id = "bootstrap",
        "gateway transport mode initialized"
    );

    let runner = app.gateway;
    let gateway = tokio::spawn(async move {
        if let Err(error) = runner.start().await {
            tracing::error!(
                event_name = "system.server.gateway_error",
                error = %error,
                "gateway runner stopped with an error"
            );
        }
    });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        ai_mode = app.orchestrator.ai_mode().as_str(),
        "ekko-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "ekko-server stopping"
    );

    gateway.abort();
    keep_alive.abort();
    // In-flight completions see a closed gate and answer with fallbacks.
    app.orchestrator.gate().close();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.db_pool.close()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            grace_secs = grace.as_secs(),
            "database pool did not close within the grace period"
        );
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
