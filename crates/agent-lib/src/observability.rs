//! Observability infrastructure for the telemetry agent
//!
//! Provides:
//! - Prometheus counters for shipped records and failures
//! - Resettable shipping counters for the periodic self-report
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    log_lines_shipped: IntCounter,
    metric_samples_shipped: IntCounter,
    metric_samples_skipped: IntCounter,
    stream_failures: IntCounterVec,
    publish_errors: IntCounter,
    checkpoint_errors: IntCounter,
    containers_tracked: IntGauge,
    event_watcher_restarts: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            log_lines_shipped: register_int_counter!(
                "telemetry_agent_log_lines_shipped_total",
                "Log lines published to the message bus"
            )
            .expect("Failed to register log_lines_shipped"),

            metric_samples_shipped: register_int_counter!(
                "telemetry_agent_metric_samples_shipped_total",
                "Stats samples published to the message bus"
            )
            .expect("Failed to register metric_samples_shipped"),

            metric_samples_skipped: register_int_counter!(
                "telemetry_agent_metric_samples_skipped_total",
                "Stats samples dropped for lack of history"
            )
            .expect("Failed to register metric_samples_skipped"),

            stream_failures: register_int_counter_vec!(
                "telemetry_agent_stream_failures_total",
                "Per-container log or stats streams that ended with an error",
                &["stream"]
            )
            .expect("Failed to register stream_failures"),

            publish_errors: register_int_counter!(
                "telemetry_agent_publish_errors_total",
                "Failed publishes to the message bus"
            )
            .expect("Failed to register publish_errors"),

            checkpoint_errors: register_int_counter!(
                "telemetry_agent_checkpoint_errors_total",
                "Failed checkpoint writes or removals"
            )
            .expect("Failed to register checkpoint_errors"),

            containers_tracked: register_int_gauge!(
                "telemetry_agent_containers_tracked",
                "Number of containers currently tracked"
            )
            .expect("Failed to register containers_tracked"),

            event_watcher_restarts: register_int_counter!(
                "telemetry_agent_event_watcher_restarts_total",
                "Times the engine event subscription was (re)started"
            )
            .expect("Failed to register event_watcher_restarts"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn inc_log_lines_shipped(&self) {
        self.inner().log_lines_shipped.inc();
    }

    pub fn inc_metric_samples_shipped(&self) {
        self.inner().metric_samples_shipped.inc();
    }

    pub fn inc_metric_samples_skipped(&self) {
        self.inner().metric_samples_skipped.inc();
    }

    /// Count a failed stream; `stream` is `logs` or `metrics`
    pub fn inc_stream_failures(&self, stream: &str) {
        self.inner()
            .stream_failures
            .with_label_values(&[stream])
            .inc();
    }

    pub fn inc_publish_errors(&self) {
        self.inner().publish_errors.inc();
    }

    pub fn inc_checkpoint_errors(&self) {
        self.inner().checkpoint_errors.inc();
    }

    pub fn set_containers_tracked(&self, count: i64) {
        self.inner().containers_tracked.set(count);
    }

    pub fn inc_event_watcher_restarts(&self) {
        self.inner().event_watcher_restarts.inc();
    }
}

/// Counters reported and reset by the poll loop every few ticks
#[derive(Debug, Default)]
pub struct ShipCounters {
    log_lines: AtomicU64,
    metric_samples: AtomicU64,
}

impl ShipCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_log_line(&self) {
        self.log_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_metric_sample(&self) {
        self.metric_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Return `(log_lines, metric_samples)` and reset both to zero
    pub fn take(&self) -> (u64, u64) {
        (
            self.log_lines.swap(0, Ordering::Relaxed),
            self.metric_samples.swap(0, Ordering::Relaxed),
        )
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for container lifecycle
/// and shipping events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a container entering the record store
    pub fn log_container_tracked(&self, container_id: &str, name: &str, service_name: &str) {
        info!(
            event = "container_tracked",
            node = %self.node_name,
            container_id = %container_id,
            container_name = %name,
            service_name = %service_name,
            "Tracking container"
        );
    }

    /// Log a container leaving the record store
    pub fn log_container_removed(&self, container_id: &str, reason: &str) {
        info!(
            event = "container_removed",
            node = %self.node_name,
            container_id = %container_id,
            reason = %reason,
            "Stopped tracking container"
        );
    }

    /// Log the periodic shipping report
    pub fn log_shipping_report(&self, log_lines: u64, metric_samples: u64, containers: usize) {
        info!(
            event = "shipping_report",
            node = %self.node_name,
            log_lines = log_lines,
            metric_samples = metric_samples,
            containers = containers,
            "Shipped telemetry since last report"
        );
    }

    /// Log loss of the engine event subscription
    pub fn log_event_watcher_down(&self, error: &str) {
        warn!(
            event = "event_watcher_down",
            node = %self.node_name,
            error = %error,
            "Engine event subscription lost"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            "Telemetry agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Telemetry agent shutting down"
        );
    }
}
