//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade; this module installs
//! the recorder and registers help text for:
//!
//! - `issuance_allocations_total` (counter): label `outcome`
//! - `issuance_codes_delivered_total` (counter)
//! - `issuance_listener_errors_total` (counter): label `reason`
//! - `issuance_listener_timeouts_total` (counter)
//! - `issuance_active_listeners` (gauge)
//! - `proxy_probes_total` (counter): label `result`
//! - `proxy_pool_proxies` (gauge): label `health`
//! - `admin_request_duration_seconds` (histogram): labels `route`, `status`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const ADMIN_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("admin_request_duration_seconds".to_string()),
            ADMIN_LATENCY_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Admin latency renders as a histogram with `_bucket` lines. Revoke can
/// take up to the session reset bound, hence the 30s top bucket.
pub fn install_recorder() -> PrometheusHandle {
    let handle = builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

fn describe() {
    metrics::describe_counter!(
        "issuance_allocations_total",
        "Approval attempts by outcome"
    );
    metrics::describe_counter!(
        "issuance_codes_delivered_total",
        "Confirmation codes delivered to requesters"
    );
    metrics::describe_counter!(
        "issuance_listener_errors_total",
        "Listeners ended by a failure, by reason"
    );
    metrics::describe_counter!(
        "issuance_listener_timeouts_total",
        "Listeners that reached their deadline"
    );
    metrics::describe_gauge!("issuance_active_listeners", "Listeners currently running");
    metrics::describe_counter!("proxy_probes_total", "Proxy health probes by result");
    metrics::describe_gauge!("proxy_pool_proxies", "Pooled proxies by health");
    metrics::describe_histogram!(
        "admin_request_duration_seconds",
        metrics::Unit::Seconds,
        "Admin API latency"
    );
}

/// Record one admin API call.
pub fn record_admin_request(route: &str, status: u16, duration_secs: f64) {
    metrics::histogram!(
        "admin_request_duration_seconds",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}
