//! Operational endpoints served next to the business routes.

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub rate_limit: RateLimitHealth,
}

#[derive(Debug, Serialize)]
pub struct RateLimitHealth {
    pub local_entries: usize,
    pub distributed: Option<StoreHealth>,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub store: &'static str,
    pub healthy: bool,
}

/// Liveness. Stays `healthy` while the shared store is down: the distributed
/// tier fails open, so the instance still serves traffic.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pipeline = &state.pipeline;

    let distributed = pipeline.distributed_limiter().map(|limiter| StoreHealth {
        store: limiter.store_name(),
        healthy: limiter.is_healthy(),
    });
    let degraded = distributed.as_ref().is_some_and(|s| !s.healthy);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        rate_limit: RateLimitHealth {
            local_entries: pipeline.local_limiter().len(),
            distributed,
        },
    })
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
