// ============================================================================
// Gateway Router
// ============================================================================
//
// Local endpoints:
// - GET /health, /services, /services/health, /metrics, /metrics/prometheus
//
// Everything else falls through to `route_request`:
// - route prefix -> service (ServiceRegistry, first registered match)
// - service -> instance (LoadBalancer, skips open circuits)
// - proxy call, outcome recorded on the instance's CircuitBreaker
//
// ============================================================================

use crate::context::GatewayContext;
use crate::error::{AppError, AppResult};
use crate::gateway::middleware::{is_bypass_path, rate_limiting};
use crate::health;
use crate::metrics::{
    self, GATEWAY_REQUESTS_TOTAL, GATEWAY_ROUTE_MISSES_TOTAL, GATEWAY_UPSTREAM_DURATION,
};
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http_body_util::LengthLimitError;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Route request to appropriate service
pub async fn route_request(
    State(ctx): State<GatewayContext>,
    request: Request<Body>,
) -> AppResult<Response> {
    let path = request.uri().path().to_string();

    // Bypass paths are never proxied
    if is_bypass_path(&path) {
        return Ok((StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" }))).into_response());
    }

    let service_name = match ctx.registry.get_service_for_route(&path) {
        Some(name) => name.to_string(),
        None => {
            GATEWAY_ROUTE_MISSES_TOTAL.inc();
            return Err(AppError::RouteNotFound(path));
        }
    };

    let timeout = ctx
        .registry
        .descriptor(&service_name)
        .map(|descriptor| descriptor.timeout())
        .ok_or_else(|| AppError::internal(format!("route points at unknown service {}", service_name)))?;

    // Read the body before picking an instance so a rejected body never
    // takes a half-open probe slot
    let (parts, body) = request.into_parts();
    let limit = ctx.config.max_body_bytes;
    let body = axum::body::to_bytes(body, limit).await.map_err(|e| {
        let inner = e.into_inner();
        if inner.is::<LengthLimitError>() {
            AppError::PayloadTooLarge(limit)
        } else {
            AppError::BadRequest(inner.to_string())
        }
    })?;

    let instance = match ctx.registry.get_service_url(&service_name).await {
        Some(instance) => instance,
        None => {
            GATEWAY_REQUESTS_TOTAL
                .with_label_values(&[service_name.as_str(), "unavailable"])
                .inc();
            return Err(AppError::ServiceUnavailable(service_name));
        }
    };

    tracing::debug!(
        service = %service_name,
        instance = %instance.url(),
        method = %parts.method,
        path = %path,
        "Routing request"
    );

    let timer = GATEWAY_UPSTREAM_DURATION
        .with_label_values(&[service_name.as_str()])
        .start_timer();
    let result = ctx
        .service_client
        .forward_request(&instance, timeout, parts, body)
        .await;
    timer.observe_duration();

    let outcome = if result.is_ok() { "proxied" } else { "upstream_error" };
    GATEWAY_REQUESTS_TOTAL
        .with_label_values(&[service_name.as_str(), outcome])
        .inc();

    result
}

/// Gateway router builder
pub struct GatewayRouter;

impl GatewayRouter {
    pub fn build(ctx: GatewayContext) -> Router {
        Router::new()
            .route("/health", get(health::health))
            .route("/services", get(health::list_services))
            .route("/services/health", get(health::services_health))
            .route("/metrics", get(metrics::circuit_breakers))
            .route("/metrics/prometheus", get(metrics::prometheus_metrics))
            .fallback(route_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn_with_state(ctx.clone(), rate_limiting))
                    .into_inner(),
            )
            .with_state(ctx)
    }
}

/// Serve `router` on `listener` until `shutdown` resolves.
///
/// Peer addresses are attached as `ConnectInfo<SocketAddr>` for the rate
/// limiter's per-IP fallback.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
