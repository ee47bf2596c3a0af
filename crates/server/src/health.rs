use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use ekko_agent::{CircuitStatus, CompletionOrchestrator};
use ekko_db::DbPool;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const ALIVE_TEXT: &str = "I'm alive!";

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    orchestrator: Arc<CompletionOrchestrator>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, orchestrator: Arc<CompletionOrchestrator>) -> Self {
        Self { db_pool, orchestrator }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitReport {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub retry_in_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConcurrencyReport {
    pub in_flight: usize,
    pub capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub circuit: CircuitReport,
    pub concurrency: ConcurrencyReport,
    pub ai_mode: &'static str,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/", get(alive)).route("/health", get(health)).with_state(state)
}

/// Binds the keep-alive listener and serves it on a background task.
pub async fn spawn(
    bind_address: &str,
    port: u16,
    state: HealthState,
) -> std::io::Result<JoinHandle<()>> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "keep-alive endpoint started"
    );

    Ok(tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "keep-alive server terminated unexpectedly"
            );
        }
    }))
}

pub async fn alive() -> &'static str {
    ALIVE_TEXT
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let snapshot = state.orchestrator.circuit();
    let gate = state.orchestrator.gate();
    let ready = database.status == "ready";
    let circuit_closed = snapshot.status != CircuitStatus::Open;

    let payload = HealthResponse {
        status: if ready && circuit_closed { "ready" } else { "degraded" },
        database,
        circuit: CircuitReport {
            state: snapshot.status.as_str(),
            consecutive_failures: snapshot.consecutive_failures,
            retry_in_secs: snapshot.retry_in.map(|remaining| remaining.as_secs()),
        },
        concurrency: ConcurrencyReport { in_flight: gate.in_flight(), capacity: gate.capacity() },
        ai_mode: state.orchestrator.ai_mode().as_str(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ekko_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
