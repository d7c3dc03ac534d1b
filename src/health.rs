use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::context::GatewayContext;
use crate::utils::unix_timestamp;

/// `GET /health`: liveness of the gateway itself
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": unix_timestamp(),
    }))
}

/// `GET /services/health`: live probe of every backend
pub async fn services_health(State(ctx): State<GatewayContext>) -> Json<Value> {
    let services = ctx.registry.health_check_all_services().await;
    Json(json!({
        "gateway": "healthy",
        "services": services,
        "timestamp": unix_timestamp(),
    }))
}

/// `GET /services`: registered service names in registration order
pub async fn list_services(State(ctx): State<GatewayContext>) -> Json<Value> {
    let services = ctx.registry.service_names();
    Json(json!({
        "count": services.len(),
        "services": services,
    }))
}
