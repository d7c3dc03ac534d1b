use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Gateway error type
///
/// Variants follow the gateway's failure taxonomy: routing, availability,
/// transport and infrastructure errors. Admission denials (429) are not
/// errors and are produced by the rate limiting middleware directly.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Routing Errors =====
    #[error("No service registered for route: {0}")]
    RouteNotFound(String),

    // ===== Availability Errors =====
    #[error("No available instance for service: {0}")]
    ServiceUnavailable(String),

    // ===== Transport Errors =====
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Request body too large (limit {0} bytes)")]
    PayloadTooLarge(usize),

    #[error("Invalid request body: {0}")]
    BadRequest(String),

    // ===== Infrastructure Errors =====
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store error: {0}")]
    CounterStore(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Internal Server Errors =====
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing `detail` message. Never carries upstream error text.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::RouteNotFound(_) => "Service not found for route",
            AppError::ServiceUnavailable(_) => "Service unavailable",
            AppError::PayloadTooLarge(_) => "Request body too large",
            AppError::BadRequest(_) => "Invalid request body",
            _ => "Internal server error",
        }
    }

    /// Get error code for programmatic error handling
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Redis(_) | AppError::CounterStore(_) => "COUNTER_STORE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Log this error with the level its category calls for
    pub fn log(&self) {
        let code = self.error_code();

        match self {
            AppError::RouteNotFound(_)
            | AppError::PayloadTooLarge(_)
            | AppError::BadRequest(_) => {
                tracing::debug!(error = %self, error_code = %code, "Client error occurred");
            }
            AppError::ServiceUnavailable(_)
            | AppError::Redis(_)
            | AppError::CounterStore(_) => {
                tracing::warn!(error = %self, error_code = %code, "Degraded dependency");
            }
            _ => {
                tracing::error!(
                    error = %self,
                    error_code = %code,
                    status = %self.status_code().as_u16(),
                    "Server error occurred"
                );
            }
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    pub fn counter_store(msg: impl Into<String>) -> Self {
        AppError::CounterStore(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status_code();
        (status, Json(json!({ "detail": self.user_message() }))).into_response()
    }
}
