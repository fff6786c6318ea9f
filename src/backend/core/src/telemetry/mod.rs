//! Telemetry: logging, optional trace export, and Prometheus metrics.
//!
//! - **Logging**: structured JSON/pretty/compact output with sensitive data redaction
//! - **Tracing**: OpenTelemetry OTLP span export when an endpoint is configured
//! - **Metrics**: Prometheus counters and histograms for every defense stage
//!
//! # Example
//!
//! ```rust,no_run
//! use menu_guard_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! let handle = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern,
    SensitiveFieldRedactor,
};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer};
use opentelemetry_sdk::Resource;
use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name for identification in traces and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// OTLP gRPC endpoint; span export is off when unset
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            otlp_endpoint: None,
        }
    }
}

fn default_service_name() -> String {
    "menu-guard".to_string()
}

fn default_environment() -> String {
    std::env::var("MENU_GUARD_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize the complete telemetry stack.
///
/// Call once at startup, inside the Tokio runtime (the span exporter batches
/// on it).
///
/// # Errors
///
/// Returns an error if any component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;

    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => Some(init_otlp_tracer(endpoint, config)?),
        None => None,
    };
    let exporting = tracer.is_some();

    init_logging(&config.logging, &config.environment, tracer)?;

    ::tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        otlp = exporting,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics, exporting })
}

fn init_otlp_tracer(endpoint: &str, config: &TelemetryConfig) -> anyhow::Result<Tracer> {
    let resource = Resource::new(vec![
        opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        opentelemetry::KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}

/// Handle for managing telemetry lifecycle.
pub struct TelemetryHandle {
    /// Metrics handle for rendering the Prometheus endpoint
    pub metrics: MetricsRegistry,
    exporting: bool,
}

impl TelemetryHandle {
    /// Flush pending spans and stop exporting.
    pub fn shutdown(self) {
        if self.exporting {
            opentelemetry::global::shutdown_tracer_provider();
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}
