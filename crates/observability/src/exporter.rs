//! Prometheus scrape endpoint.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the process-wide Prometheus recorder and serve `/metrics` on
/// `listen`. Must run inside a tokio runtime and before any
/// `QueueMetrics`/`DispatchMetrics` is built, or those handles stay unexported.
pub fn install_prometheus(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    crate::metrics::describe();
    Ok(())
}
