//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, service
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_rate_limited_total` (counter): rejections by tier
//! - `gateway_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `gateway_circuit_rejections_total` (counter): calls refused by an open breaker
//! - `gateway_upstream_errors_total` (counter): failed calls by error code
//! - `gateway_retries_total` (counter): retry attempts by reason
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";
    pub const CIRCUIT_STATE: &str = "gateway_circuit_state";
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "gateway_circuit_rejections_total";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
    pub const RETRIES_TOTAL: &str = "gateway_retries_total";
}

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed gateway request.
pub fn record_request(method: &str, status: u16, service: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("service", service.to_string()),
    ];
    counter!(names::REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(tier: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "tier" => tier.to_string()).increment(1);
}

pub fn record_circuit_state(service: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    gauge!(names::CIRCUIT_STATE, "service" => service.to_string()).set(value);
}

pub fn record_circuit_rejection(service: &str) {
    counter!(names::CIRCUIT_REJECTIONS_TOTAL, "service" => service.to_string()).increment(1);
}

pub fn record_upstream_error(code: &str) {
    counter!(names::UPSTREAM_ERRORS_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn record_retry(reason: &str) {
    counter!(names::RETRIES_TOTAL, "reason" => reason.to_string()).increment(1);
}
