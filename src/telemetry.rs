//! Telemetry module for mcpscope
//!
//! Prometheus metrics for proxied traffic and outgoing MCP requests.

use crate::{Result, ScopeError};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, TextEncoder,
    register_counter_vec, register_histogram_vec, register_int_counter,
};
use std::time::Duration;

/// Requests forwarded by the interception proxy
static PROXY_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mcpscope_proxy_requests_total",
        "Total number of requests forwarded by the interception proxy",
        &["method", "status"]
    )
    .unwrap()
});

/// Network failures while forwarding
static PROXY_UPSTREAM_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "mcpscope_proxy_upstream_errors_total",
        "Total number of upstream network failures seen by the proxy"
    )
    .unwrap()
});

/// Outgoing MCP requests by outcome
static MCP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mcpscope_mcp_requests_total",
        "Total number of MCP requests sent to managed servers",
        &["method", "outcome"]
    )
    .unwrap()
});

/// MCP request latency
static MCP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        HistogramOpts::new(
            "mcpscope_mcp_request_duration_seconds",
            "Duration of MCP requests in seconds"
        ),
        &["method"]
    )
    .unwrap()
});

/// Record a proxied request and the status returned to the client
pub fn record_proxy_request(method: &str, status_code: u16) {
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[method, &status_code.to_string()])
        .inc();
}

pub fn record_upstream_error() {
    PROXY_UPSTREAM_ERRORS_TOTAL.inc();
}

/// Record an MCP request; `outcome` is `ok`, `timeout` or `error`
pub fn record_mcp_request(method: &str, outcome: &str, elapsed: Duration) {
    MCP_REQUESTS_TOTAL
        .with_label_values(&[method, outcome])
        .inc();
    MCP_REQUEST_DURATION
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

/// Get Prometheus metrics in text format
pub fn get_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ScopeError::config(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| ScopeError::config(format!("Failed to convert metrics to UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        record_proxy_request("POST", 200);
        record_upstream_error();
        record_mcp_request("tools/list", "ok", Duration::from_millis(12));

        let metrics = get_metrics().unwrap();

        assert!(metrics.contains("mcpscope_proxy_requests_total"));
        assert!(metrics.contains("mcpscope_proxy_upstream_errors_total"));
        assert!(metrics.contains("mcpscope_mcp_requests_total"));
        assert!(metrics.contains("mcpscope_mcp_request_duration_seconds"));
    }
}
