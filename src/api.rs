//! HTTP surface for the scheduler
//!
//! - GET /health - service health snapshot
//! - POST /cycle - run one reconciliation cycle now

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::scheduler::{Scheduler, ServiceHealth};

pub type AppState = Arc<Scheduler>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub health: ServiceHealth,
}

/// GET /health
///
/// 200 while cycles succeed, 503 after a run of failed cycles.
async fn handle_health(State(scheduler): State<AppState>) -> impl IntoResponse {
    let health = scheduler.get_service_health().await;
    let (code, status) = if health.consecutive_failures == 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = HealthResponse {
        status,
        service: "trc20-gateway",
        version: env!("CARGO_PKG_VERSION"),
        health,
    };
    (code, Json(response))
}

/// POST /cycle
async fn handle_cycle(State(scheduler): State<AppState>) -> impl IntoResponse {
    let report = scheduler.trigger_reconciliation_cycle().await;
    Json(report)
}

pub fn create_router(scheduler: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/cycle", post(handle_cycle))
        .with_state(scheduler)
}

/// Serve until the scheduler's shutdown token fires
pub async fn start_server(scheduler: AppState, port: u16) -> Result<(), std::io::Error> {
    let shutdown = scheduler.shutdown_token();
    let app = create_router(scheduler);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
