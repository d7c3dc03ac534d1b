// ============================================================================
// Gateway Middleware
// ============================================================================
//
// Admission control in front of every route:
// - Operational endpoints (health, metrics, docs) pass straight through
// - Everything else is counted by the RateLimiter
// - Denials short-circuit with 429 and X-RateLimit-* / Retry-After headers
// - Admitted responses carry the same quota headers
//
// ============================================================================

use crate::context::GatewayContext;
use crate::gateway::rate_limiter::RateLimitDecision;
use crate::metrics::{GATEWAY_RATE_LIMITED_TOTAL, GATEWAY_RATE_LIMIT_FAIL_OPEN_TOTAL};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;

/// Paths that skip rate limiting and service routing
pub const BYPASS_PATHS: &[&str] = &["/health", "/metrics", "/docs", "/redoc", "/openapi.json"];

/// True for a bypass path or anything nested below one
pub fn is_bypass_path(path: &str) -> bool {
    BYPASS_PATHS.iter().any(|bypass| {
        path == *bypass
            || path
                .strip_prefix(bypass)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Rate limiting middleware
pub async fn rate_limiting(
    State(ctx): State<GatewayContext>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_bypass_path(&path) {
        return next.run(request).await;
    }

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let decision = ctx
        .rate_limiter
        .check(&path, request.headers(), client_ip)
        .await;

    match decision {
        RateLimitDecision::Denied(info) => {
            GATEWAY_RATE_LIMITED_TOTAL.inc();
            tracing::debug!(
                path = %path,
                limit = info.limit,
                retry_after = info.retry_after,
                "Request rate limited"
            );

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "detail": "Rate limit exceeded" })),
            )
                .into_response();
            info.apply_headers(response.headers_mut(), true);
            response
        }
        RateLimitDecision::Allowed(Some(info)) => {
            let mut response = next.run(request).await;
            info.apply_headers(response.headers_mut(), false);
            response
        }
        RateLimitDecision::Allowed(None) => {
            GATEWAY_RATE_LIMIT_FAIL_OPEN_TOTAL.inc();
            next.run(request).await
        }
    }
}
