//! # Metrics Collection
//!
//! Prometheus metrics for the controller loops. Recording goes through the
//! `metrics` facade, so calls are no-ops until [`init_metrics`] installs the
//! exporter.

use crate::config::ObservabilityConfig;
use crate::domain::RotationTransition;
use crate::errors::{BridgeError, Result};
use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

/// Metrics recorder that tracks controller metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record one Bridge poll by outcome
    pub fn record_poll(&self, outcome: &str, duration: f64) {
        counter!("oidc_bridge_polls_total", "outcome" => outcome.to_string()).increment(1);
        histogram!("oidc_bridge_poll_duration_seconds").record(duration);
    }

    /// Record the key movements of a committed rotation
    pub fn record_rotation(&self, transition: &RotationTransition) {
        let counts = [
            ("added", transition.added.len()),
            ("retiring", transition.retiring.len()),
            ("resurrected", transition.resurrected.len()),
            ("dropped", transition.dropped.len()),
        ];
        for (kind, count) in counts {
            if count > 0 {
                counter!("oidc_bridge_rotation_keys_total", "kind" => kind).increment(count as u64);
            }
        }
        counter!("oidc_bridge_rotations_total").increment(1);
    }

    /// Update the gauges of the currently committed key set
    pub fn set_published_keys(&self, active: usize, retiring: usize) {
        gauge!("oidc_bridge_published_keys", "state" => "active").set(active as f64);
        gauge!("oidc_bridge_published_keys", "state" => "retiring").set(retiring as f64);
    }

    /// Record one object publish by path and outcome
    pub fn record_publish(&self, path: &str, outcome: &str) {
        let labels = [("path", path.to_string()), ("outcome", outcome.to_string())];
        counter!("oidc_bridge_publish_total", &labels).increment(1);
    }

    /// Record a storage failure that surfaced after retries
    pub fn record_storage_error(&self, operation: &str, kind: &str) {
        let labels = [("operation", operation.to_string()), ("kind", kind.to_string())];
        counter!("oidc_bridge_storage_errors_total", &labels).increment(1);
    }

    /// Record an upstream fetch failure
    pub fn record_upstream_error(&self, kind: &str) {
        counter!("oidc_bridge_upstream_errors_total", "kind" => kind.to_string()).increment(1);
    }

    /// Update fleet aggregation gauges
    pub fn set_fleet_clusters(&self, live: usize, stale: usize, malformed: usize, keys: usize) {
        gauge!("oidc_bridge_fleet_clusters", "state" => "live").set(live as f64);
        gauge!("oidc_bridge_fleet_clusters", "state" => "stale").set(stale as f64);
        gauge!("oidc_bridge_fleet_clusters", "state" => "malformed").set(malformed as f64);
        gauge!("oidc_bridge_fleet_keys").set(keys as f64);
    }

    /// Track whether this replica holds leadership for a role
    pub fn set_leader(&self, role: &str, is_leader: bool) {
        gauge!("oidc_bridge_leader", "role" => role.to_string()).set(if is_leader { 1.0 } else { 0.0 });
    }

    /// Register descriptions so exports appear before the first event
    pub fn register_metrics(&self) {
        describe_counter!("oidc_bridge_polls_total", Unit::Count, "Upstream polls grouped by outcome");
        describe_histogram!(
            "oidc_bridge_poll_duration_seconds",
            Unit::Seconds,
            "Duration of one upstream poll including the cache commit"
        );
        describe_counter!("oidc_bridge_rotations_total", Unit::Count, "Committed key rotations");
        describe_counter!(
            "oidc_bridge_rotation_keys_total",
            Unit::Count,
            "Keys added, retired, resurrected or dropped by rotations"
        );
        describe_gauge!("oidc_bridge_published_keys", Unit::Count, "Keys in the committed snapshot");
        describe_counter!(
            "oidc_bridge_publish_total",
            Unit::Count,
            "Object publishes grouped by path and outcome"
        );
        describe_counter!(
            "oidc_bridge_storage_errors_total",
            Unit::Count,
            "Storage operations that failed after retries"
        );
        describe_counter!(
            "oidc_bridge_upstream_errors_total",
            Unit::Count,
            "Upstream fetch failures grouped by kind"
        );
        describe_gauge!("oidc_bridge_fleet_clusters", Unit::Count, "Fleet records by state");
        describe_gauge!("oidc_bridge_fleet_keys", Unit::Count, "Keys in the fleet aggregate");
        describe_gauge!("oidc_bridge_leader", Unit::Count, "1 while this replica leads the role");

        counter!("oidc_bridge_rotations_total").absolute(0);
        for outcome in ["committed", "unchanged", "fetch_error", "issuer_mismatch", "conflict"] {
            counter!("oidc_bridge_polls_total", "outcome" => outcome).absolute(0);
        }
    }
}

/// Global metrics recorder instance
static METRICS: OnceCell<MetricsRecorder> = OnceCell::new();

/// Install the Prometheus exporter when a metrics port is configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(metrics_addr) = config.metrics_bind_address() else {
        return Ok(());
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        BridgeError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", crate::APP_NAME)
        .install()
        .map_err(|e| BridgeError::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    let recorder = METRICS.get_or_init(MetricsRecorder::new);
    recorder.register_metrics();

    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}

/// Get the global metrics recorder
pub fn get_metrics() -> Option<&'static MetricsRecorder> {
    METRICS.get()
}

pub fn record_poll(outcome: &str, duration: f64) {
    if let Some(metrics) = get_metrics() {
        metrics.record_poll(outcome, duration);
    }
}

pub fn record_rotation(transition: &RotationTransition) {
    if let Some(metrics) = get_metrics() {
        metrics.record_rotation(transition);
    }
}

pub fn set_published_keys(active: usize, retiring: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.set_published_keys(active, retiring);
    }
}

pub fn record_publish(path: &str, outcome: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_publish(path, outcome);
    }
}

pub fn record_storage_error(operation: &str, kind: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_storage_error(operation, kind);
    }
}

pub fn record_upstream_error(kind: &str) {
    if let Some(metrics) = get_metrics() {
        metrics.record_upstream_error(kind);
    }
}

pub fn set_fleet_clusters(live: usize, stale: usize, malformed: usize, keys: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.set_fleet_clusters(live, stale, malformed, keys);
    }
}

pub fn record_leadership(role: &str, is_leader: bool) {
    if let Some(metrics) = get_metrics() {
        metrics.set_leader(role, is_leader);
    }
}
