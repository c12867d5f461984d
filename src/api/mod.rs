//! Axum HTTP surface for the watchdog.
//!
//! Provides:
//!   GET  /health             → JSON HealthReport (500 when unhealthy)
//!   POST /trigger-end-round  → run one tick now, JSON TriggerResponse
//!
//! `/trigger-end-round` answers 200 for closes and skips (including
//! `Skipped: in-progress`) and 500 with `success: false` whenever the tick
//! failed, transient failures such as a nonce conflict or a failed read
//! included. Clients that only want "did the round close" should read
//! `success` and treat 500 as "retry later".

use crate::health::HealthReport;
use crate::scheduler::Scheduler;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state for the routes.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: String,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trigger-end-round", post(trigger_end_round))
        .with_state(state)
}

/// Bind `bind_addr` and serve until `shutdown` resolves.
pub async fn serve<F>(state: ApiState, bind_addr: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    serve_listener(listener, state, shutdown).await
}

/// Serve on an already-bound listener. Tests bind `127.0.0.1:0` and pass it here.
pub async fn serve_listener<F>(listener: TcpListener, state: ApiState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http server stopped");
    Ok(())
}

// --- Handlers ---

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let report: HealthReport = state.scheduler.health_report().await;
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report))
}

async fn trigger_end_round(State(state): State<ApiState>) -> impl IntoResponse {
    info!("manual trigger received");
    // Runs on its own task: a client hanging up must not cancel the close.
    let outcome = state.scheduler.clone().trigger().await;

    let status = if outcome.is_failure() {
        warn!(outcome = %outcome, "manual trigger failed");
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    let body = TriggerResponse {
        success: outcome.success(),
        message: outcome.message(),
        timestamp: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    (status, Json(body))
}
