//! Lightweight facade around tracing setup and the metrics recorder.
//!
//! Services call [`init_telemetry`] once at startup; the returned
//! [`PrometheusHandle`], when present, renders the `/metrics` endpoint body.

use std::sync::OnceLock;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Span;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Default filter directive when `RUST_LOG` is unset (e.g. `info`).
    pub level: String,
    pub json_logs: bool,
    /// Install the Prometheus recorder and expose a render handle.
    pub prometheus: bool,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            level: "info".into(),
            json_logs: false,
            prometheus: true,
        }
    }
}

/// Initializes the tracing subscriber and, when requested, the Prometheus
/// metrics recorder. Safe to call more than once; later calls keep the first
/// subscriber and recorder.
pub fn init_telemetry(cfg: &TelemetryConfig) -> Result<Option<PrometheusHandle>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    if cfg.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }

    if !cfg.prometheus {
        return Ok(None);
    }
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(Some(handle.clone()));
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    PROMETHEUS.set(handle.clone()).ok();
    tracing::info!(service = %cfg.service_name, "telemetry initialized");
    Ok(Some(handle))
}

/// Records the common identifying fields on a span created with empty
/// placeholders.
pub fn with_common_fields(
    span: &Span,
    conversation_id: Option<&str>,
    user_id: Option<&str>,
    message_id: Option<&str>,
) {
    if let Some(conversation_id) = conversation_id {
        span.record("conversation_id", tracing::field::display(conversation_id));
    }
    if let Some(user_id) = user_id {
        span.record("user_id", tracing::field::display(user_id));
    }
    if let Some(message_id) = message_id {
        span.record("message_id", tracing::field::display(message_id));
    }
}

pub fn record_counter(name: &'static str, value: u64, labels: &[(&'static str, String)]) {
    metrics::counter!(name, labels).increment(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &[(&'static str, String)]) {
    metrics::gauge!(name, labels).set(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &[(&'static str, String)]) {
    metrics::histogram!(name, labels).record(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let cfg = TelemetryConfig {
            prometheus: false,
            ..TelemetryConfig::new("relay-test")
        };
        init_telemetry(&cfg).expect("first init");
        init_telemetry(&cfg).expect("second init");
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_counter("relay_test_total", 1, &[("kind", "unit".to_string())]);
        record_gauge("relay_test_gauge", 0.5, &[]);
        record_histogram("relay_test_seconds", 0.01, &[]);
    }
}
