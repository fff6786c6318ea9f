//! Menu Guard Server - Main entry point
//!
//! Runs the request defense pipeline in front of the platform's HTTP routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

use menu_guard_core::{
    api::{self, AppState},
    config::Config,
    middleware::{DefensePipeline, DistributedRateLimiter, LocalRateLimiter, RedisStore},
    telemetry,
};

const CONFIG_PATH_VAR: &str = "MENU_GUARD_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration. An explicit file must load; the environment alone
    // may fall back to defaults.
    let config = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config from environment: {}. Using defaults.", e);
            Config::default()
        }),
    };
    config.validate()?;

    // Initialize telemetry
    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Menu Guard"
    );

    // Local tier and its sweeper
    let local = Arc::new(LocalRateLimiter::new(config.defense.sweep_interval));

    // Distributed tier. A store that is unreachable at startup leaves the
    // instance on the local tier only.
    let distributed = match config.redis.url.as_deref() {
        Some(url) => match RedisStore::connect(
            url,
            config.redis.key_prefix.clone(),
            config.redis.connect_timeout,
        )
        .await
        {
            Ok(store) => Some(Arc::new(
                DistributedRateLimiter::new(Arc::new(store))
                    .with_recheck_interval(config.redis.recheck_interval)
                    .with_command_timeout(config.redis.command_timeout),
            )),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis unavailable at startup, running with local rate limiting only"
                );
                None
            }
        },
        None => {
            tracing::info!("No Redis URL configured, running with local rate limiting only");
            None
        }
    };

    let pipeline = Arc::new(DefensePipeline::new(
        &config.defense,
        local.clone(),
        distributed,
    )?);
    tracing::info!(pipeline = ?pipeline, "Defense pipeline initialized");

    // Build router
    let state = AppState::new(pipeline, telemetry.metrics.clone());
    let app = api::build_router(state, Router::new());

    // Start server
    let addr: SocketAddr = config.server.bind_address().parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cleanup
    local.shutdown().await;
    telemetry.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
