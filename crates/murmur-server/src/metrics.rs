//! Metrics collection and export for murmur.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::BroadcastReport;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const STREAMS_TOTAL: &str = "murmur_streams_total";
    pub const STREAMS_ACTIVE: &str = "murmur_streams_active";
    pub const MESSAGES_SENT_TOTAL: &str = "murmur_messages_sent_total";
    pub const EVENTS_DELIVERED_TOTAL: &str = "murmur_events_delivered_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "murmur_events_dropped_total";
    pub const SEND_LATENCY_SECONDS: &str = "murmur_send_latency_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::STREAMS_TOTAL,
        "Total number of live streams opened since server start"
    );
    metrics::describe_gauge!(names::STREAMS_ACTIVE, "Current number of live streams");
    metrics::describe_counter!(names::MESSAGES_SENT_TOTAL, "Total number of messages persisted");
    metrics::describe_counter!(
        names::EVENTS_DELIVERED_TOTAL,
        "Total number of events queued to live streams"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Total number of events dropped on full or closed queues"
    );
    metrics::describe_histogram!(
        names::SEND_LATENCY_SECONDS,
        "Time to persist and fan out a message, in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of request errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new live stream.
pub fn record_stream_opened(transport: &'static str) {
    counter!(names::STREAMS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::STREAMS_ACTIVE).increment(1.0);
}

/// Record a closed live stream.
pub fn record_stream_closed() {
    gauge!(names::STREAMS_ACTIVE).decrement(1.0);
}

/// Record a persisted message and how its fan-out went.
pub fn record_send(report: &BroadcastReport, seconds: f64) {
    counter!(names::MESSAGES_SENT_TOTAL).increment(1);
    record_broadcast(report);
    histogram!(names::SEND_LATENCY_SECONDS).record(seconds);
}

/// Record a broadcast outcome.
pub fn record_broadcast(report: &BroadcastReport) {
    counter!(names::EVENTS_DELIVERED_TOTAL).increment(report.delivered as u64);
    if report.dropped > 0 {
        counter!(names::EVENTS_DROPPED_TOTAL).increment(report.dropped as u64);
    }
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records stream closure on drop.
pub struct StreamMetricsGuard;

impl StreamMetricsGuard {
    /// Create a new metrics guard, recording an opened stream.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        record_stream_opened(transport);
        Self
    }
}

impl Drop for StreamMetricsGuard {
    fn drop(&mut self) {
        record_stream_closed();
    }
}
