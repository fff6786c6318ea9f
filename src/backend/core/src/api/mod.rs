//! HTTP surface for Menu Guard.
//!
//! [`build_router`] puts the defense pipeline in front of caller-supplied
//! business routes and serves the operational endpoints next to them:
//!
//! - `GET /health`: liveness plus rate limiter state
//! - `GET /metrics`: Prometheus text format
//!
//! Both are exempt from the pipeline by default.
//!
//! # Example
//!
//! ```rust,ignore
//! let routes = Router::new().route("/api/venues", post(create_venue));
//! let app = build_router(AppState::new(pipeline, metrics), routes);
//! ```

mod handlers;

pub use handlers::{HealthResponse, RateLimitHealth, StoreHealth};

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::middleware::{DefenseLayer, DefensePipeline};
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DefensePipeline>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub fn new(pipeline: Arc<DefensePipeline>, metrics: MetricsRegistry) -> Self {
        Self {
            pipeline,
            metrics: Arc::new(metrics),
        }
    }
}

/// Build the router: operational endpoints, the caller's routes, then the
/// defense layer and request tracing around all of them.
pub fn build_router(state: AppState, routes: Router) -> Router {
    let defense = DefenseLayer::new(state.pipeline.clone());

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
        .merge(routes)
        .layer(defense)
        .layer(TraceLayer::new_for_http())
}
