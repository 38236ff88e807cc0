//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::auth::AppState;

/// Basic health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Worker counters reported by the detailed check
#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub database: String,
    pub worker_cycles: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Liveness check (is the process running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness check (is the store reachable)
pub async fn readiness(State(state): State<Arc<AppState>>) -> Result<StatusCode, StatusCode> {
    if let Some(pool) = &state.db_pool {
        pool.ping()
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    }

    Ok(StatusCode::OK)
}

/// Detailed health check with delivery counters
pub async fn health_detailed(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    let database = match &state.db_pool {
        Some(pool) => match pool.ping().await {
            Ok(latency) => format!("healthy ({}ms)", latency.as_millis()),
            Err(e) => format!("unhealthy: {}", e),
        },
        None => "memory".to_string(),
    };

    let status = if database.starts_with("unhealthy") {
        "unhealthy"
    } else {
        "healthy"
    };

    let stats = state.worker.stats();
    Json(DetailedHealthResponse {
        status: status.to_string(),
        database,
        worker_cycles: stats.cycles.load(Ordering::Relaxed),
        sent: stats.sent.load(Ordering::Relaxed),
        retried: stats.retried.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
    })
}
