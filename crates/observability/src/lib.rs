//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Counters and gauges for the queue and the outbox dispatcher.
pub mod metrics;

/// Prometheus exporter for those instruments.
pub mod exporter;

pub use exporter::install_prometheus;
pub use self::metrics::{Counter, DispatchMetrics, DispatchMetricsSnapshot, Gauge, LANES, QueueMetrics, QueueMetricsSnapshot};
pub use self::tracing::{LogFormat, init_with};
