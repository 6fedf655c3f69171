use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics` on the
/// admin listener.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "edge_http_requests_total",
            Unit::Count,
            "HTTP requests handled by the terminating proxy"
        );
        describe_histogram!(
            "edge_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration from the client's perspective"
        );
        describe_histogram!(
            "edge_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting on the selected backend"
        );
        describe_gauge!(
            "edge_http_requests_in_flight",
            Unit::Count,
            "Requests currently being proxied, per pool"
        );
        describe_counter!(
            "edge_tcp_bytes_transferred_total",
            Unit::Bytes,
            "Bytes spliced through passthrough listeners"
        );

        // listeners
        describe_counter!(
            "edge_connections_total",
            Unit::Count,
            "Accepted/errored connections per listener"
        );
        describe_gauge!(
            "edge_connections_active",
            Unit::Count,
            "Currently open client connections"
        );

        // health checking
        describe_counter!(
            "edge_health_check_total",
            Unit::Count,
            "Health probe outcomes per pool"
        );
        describe_gauge!(
            "edge_backend_health_status",
            Unit::Count,
            "1 when the backend is selectable, 0 otherwise"
        );

        // cluster
        describe_counter!(
            "edge_store_replication_total",
            Unit::Count,
            "Replication ship attempts per peer and result"
        );

        Self { handle }
    }

    /// Render the Prometheus exposition text.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
