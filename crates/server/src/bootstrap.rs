use std::{sync::Arc, time::Duration};

use ekko_agent::{CompletionError, CompletionOrchestrator, ConversationService, RelayPolicy};
use ekko_core::config::{AppConfig, ConfigError, LoadOptions};
use ekko_db::{
    connect_with_settings, migrations, ConversationRepository, DbPool, SqlConversationRepository,
};
use ekko_gateway::{GatewayRunner, GatewayTransport, NoopGatewayTransport, ReconnectPolicy};
use thiserror::Error;
use tracing::{info, warn};

use crate::services::{self, ChatBridge};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<CompletionOrchestrator>,
    pub conversation: Arc<ConversationService>,
    pub gateway: GatewayRunner,
    pub transport_mode: &'static str,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("completion backend setup failed: {0}")]
    Completion(#[from] CompletionError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let personas = config.persona_catalog()?;
    let orchestrator = Arc::new(CompletionOrchestrator::from_config(&config)?);
    let repository: Arc<dyn ConversationRepository> =
        Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let conversation =
        Arc::new(ConversationService::new(Arc::clone(&orchestrator), repository, personas));

    let policy = RelayPolicy::new(
        config.discord.target_channels.clone(),
        Duration::from_secs(config.conversation.cooldown_secs),
    );
    let bridge = Arc::new(ChatBridge::new(Arc::clone(&conversation), policy));

    // Only the no-op transport ships in this workspace; a platform client
    // plugs in through `GatewayTransport`.
    if !config.has_discord_token() {
        warn!(
            event_name = "system.bootstrap.discord_token_missing",
            correlation_id = "bootstrap",
            "no discord token configured; gateway runs without a platform connection"
        );
    }
    let transport: Arc<dyn GatewayTransport> = Arc::new(NoopGatewayTransport);
    let gateway =
        GatewayRunner::new(transport, services::dispatcher(bridge), ReconnectPolicy::default());

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        ai_mode = orchestrator.ai_mode().as_str(),
        personas = conversation.personas().len(),
        target_channels = config.discord.target_channels.len(),
        "application bootstrap complete"
    );

    Ok(Application {
        config,
        db_pool,
        orchestrator,
        conversation,
        gateway,
        transport_mode: "noop",
    })
}

#[cfg(test)]
mod tests {
    use ekko_core::config::{ConfigOverrides, LoadOptions};
    use ekko_core::domain::conversation::ConversationKey;

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            config_path: Some("does-not-exist/ekko.toml".into()),
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_database_urls() {
        let result = bootstrap(options("postgres://localhost/ekko")).await;

        let Err(BootstrapError::Config(error)) = result else {
            panic!("expected a configuration error");
        };
        assert!(error.to_string().contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_conversation_history() {
        let app = bootstrap(options("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with defaults");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chats'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("chats table should exist after bootstrap");
        assert_eq!(table_count, 1);

        assert_eq!(app.transport_mode, "noop");
        assert!(app.conversation.personas().contains("tieu_thu_dong"));
        assert_eq!(app.orchestrator.gate().capacity(), app.config.llm.concurrency);

        let key = ConversationKey::new("U1", "C1");
        let removed = app.conversation.reset(&key).await.expect("reset on empty history");
        assert_eq!(removed, 0);

        app.gateway.start().await.expect("noop gateway ends cleanly");
        app.db_pool.close().await;
    }
}
