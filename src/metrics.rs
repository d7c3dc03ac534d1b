use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use serde_json::{json, Value};

use crate::context::GatewayContext;
use crate::utils::unix_timestamp;

/// Proxied requests by service and outcome (proxied | upstream_error | unavailable)
pub static GATEWAY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gateway_requests_total",
            "Requests routed to backend services"
        ),
        &["service", "outcome"]
    )
    .unwrap()
});

pub static GATEWAY_ROUTE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gateway_route_misses_total",
        "Requests with no matching service route"
    ))
    .unwrap()
});

pub static GATEWAY_RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    ))
    .unwrap()
});

pub static GATEWAY_RATE_LIMIT_FAIL_OPEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gateway_rate_limit_fail_open_total",
        "Requests admitted because the counter store was unavailable"
    ))
    .unwrap()
});

pub static GATEWAY_UPSTREAM_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_upstream_duration_seconds",
        "Time spent waiting on backend instances",
        &["service"]
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

/// `GET /metrics`: circuit breaker state per service and instance
pub async fn circuit_breakers(State(ctx): State<GatewayContext>) -> Json<Value> {
    let services = ctx.registry.breaker_snapshot().await;
    Json(json!({
        "services": services,
        "timestamp": unix_timestamp(),
    }))
}

/// `GET /metrics/prometheus`: text exposition format
pub async fn prometheus_metrics() -> Response {
    match gather_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to gather metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_gather_includes_gateway_metrics() {
        GATEWAY_ROUTE_MISSES_TOTAL.inc();
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&["auth", "proxied"])
            .inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("gateway_route_misses_total"));
        assert!(text.contains("gateway_requests_total{outcome=\"proxied\",service=\"auth\"}"));
    }
}
