//! Prometheus metrics.
//!
//! Uses the `metrics` facade with the Prometheus exporter installed as the
//! global recorder. The handle returned by [`get_or_install_recorder`] renders
//! the text exposition for the `/metrics` endpoint.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::util::Host;

pub const REQUESTS_TOTAL: &str = "coco_requests_total";
pub const DROPPED_REQUESTS_TOTAL: &str = "coco_dropped_request_total";
pub const CALLS_TOTAL: &str = "coco_calls_total";
pub const EXTERNAL_RESPONSE_TIME: &str = "coco_external_response_time_seconds";
pub const QUEUE_LENGTH: &str = "coco_queue_length";

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Ensure the global Prometheus recorder is installed and return the handle.
/// Must be called before any `metrics` macro calls so they aren't no-ops.
pub fn get_or_install_recorder() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install the Prometheus metrics recorder");
            describe_counter!(REQUESTS_TOTAL, "Requests received by coco.");
            describe_counter!(DROPPED_REQUESTS_TOTAL, "Requests dropped at the queue boundary.");
            describe_counter!(CALLS_TOTAL, "Calls forwarded by coco to hosts.");
            describe_histogram!(EXTERNAL_RESPONSE_TIME, "Response time of forwarded calls.");
            describe_gauge!(QUEUE_LENGTH, "Number of requests waiting in the queue.");
            handle
        })
        .clone()
}

pub fn record_request(endpoint: &str) {
    counter!(REQUESTS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_dropped_request(endpoint: &str) {
    counter!(DROPPED_REQUESTS_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_call(endpoint: &str, host: &Host, status: u16) {
    counter!(
        CALLS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "host" => host.hostname().to_string(),
        "port" => host.port().map(|p| p.to_string()).unwrap_or_default(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_response_time(endpoint: &str, host: &Host, seconds: f64) {
    histogram!(
        EXTERNAL_RESPONSE_TIME,
        "endpoint" => endpoint.to_string(),
        "host" => host.hostname().to_string(),
        "port" => host.port().map(|p| p.to_string()).unwrap_or_default(),
    )
    .record(seconds);
}

pub fn queue_length_inc() {
    gauge!(QUEUE_LENGTH).increment(1.0);
}

pub fn queue_length_dec() {
    gauge!(QUEUE_LENGTH).decrement(1.0);
}
