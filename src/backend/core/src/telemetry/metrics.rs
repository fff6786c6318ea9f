//! Prometheus metrics for the defense pipeline.
//!
//! Call sites record through the `metrics` facade macros; this module installs
//! the Prometheus recorder, describes every series and renders the text format
//! for `/metrics`.
//!
//! Series:
//! - `defense_rejections_total{stage,class}`
//! - `defense_pipeline_duration_seconds`
//! - `rate_limit_checks_total{tier,outcome}`
//! - `rate_limit_degraded_total{reason}`
//! - `rate_limit_local_entries`
//! - `sanitizer_blocked_total{pattern}`
//! - `sanitizer_stripped_total`
//! - `errors_total{code,category}`

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for pipeline durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
}

/// Handle for rendering collected metrics.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Registry that renders nothing. Used when metrics are disabled and in tests.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets_for_metric(
        Matcher::Full("defense_pipeline_duration_seconds".to_string()),
        &config.duration_buckets,
    )?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "defense_rejections_total",
        "Requests rejected by the defense pipeline, by stage and traffic class"
    );
    describe_histogram!(
        "defense_pipeline_duration_seconds",
        Unit::Seconds,
        "Time spent in the defense pipeline before the request reaches its handler"
    );

    describe_counter!(
        "rate_limit_checks_total",
        "Rate limit checks, by tier and outcome"
    );
    describe_counter!(
        "rate_limit_degraded_total",
        "Distributed rate limit checks skipped because the store was unavailable"
    );
    describe_gauge!(
        "rate_limit_local_entries",
        "Live entries in the local rate limiter after the last sweep"
    );

    describe_counter!(
        "sanitizer_blocked_total",
        "Values rejected by the input sanitizer, by pattern"
    );
    describe_counter!(
        "sanitizer_stripped_total",
        "Free-text values changed by formatting cleanup"
    );

    describe_counter!("errors_total", "Errors by code and category");
}
