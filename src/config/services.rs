// ============================================================================
// Backend Service Table
// ============================================================================
//
// Static description of every backend the gateway forwards to. Built once at
// startup (built-in table or GATEWAY_SERVICES_FILE), validated, then frozen.
//
// ============================================================================

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_COUNT: u32 = 3;

/// One logical backend service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Logical name (e.g. "auth", "search")
    pub name: String,
    /// Base URLs, one per instance
    pub urls: Vec<String>,
    /// Path prefixes owned by this service, matched in declaration order
    pub routes: Vec<String>,
    /// Health endpoint path on each instance (e.g. "/health")
    pub health_path: String,
    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Reserved; the gateway itself never retries
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>, routes: &[&str]) -> Self {
        Self {
            name: name.into(),
            urls: vec![url.into()],
            routes: routes.iter().map(|r| r.to_string()).collect(),
            health_path: "/health".to_string(),
            timeout_secs: DEFAULT_SERVICE_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_health_path(mut self, health_path: impl Into<String>) -> Self {
        self.health_path = health_path.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fail fast on anything the request path would otherwise trip over
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::config("service name must not be empty"));
        }
        if self.urls.is_empty() {
            return Err(AppError::config(format!(
                "service '{}' has no base URL",
                self.name
            )));
        }
        for url in &self.urls {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                AppError::config(format!("service '{}' has invalid URL '{}': {}", self.name, url, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(AppError::config(format!(
                    "service '{}' URL '{}' must use http or https",
                    self.name, url
                )));
            }
        }
        if self.routes.is_empty() {
            return Err(AppError::config(format!(
                "service '{}' declares no route prefixes",
                self.name
            )));
        }
        for route in &self.routes {
            if !route.starts_with('/') {
                return Err(AppError::config(format!(
                    "service '{}' route prefix '{}' must start with '/'",
                    self.name, route
                )));
            }
        }
        if !self.health_path.starts_with('/') {
            return Err(AppError::config(format!(
                "service '{}' health path '{}' must start with '/'",
                self.name, self.health_path
            )));
        }
        if self.timeout_secs == 0 {
            return Err(AppError::config(format!(
                "service '{}' timeout must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Validate a whole service table
pub fn validate_services(services: &[ServiceDescriptor]) -> AppResult<()> {
    if services.is_empty() {
        return Err(AppError::config("at least one backend service must be configured"));
    }

    let mut seen = HashSet::new();
    for service in services {
        service.validate()?;
        if !seen.insert(service.name.as_str()) {
            return Err(AppError::config(format!(
                "duplicate service name '{}'",
                service.name
            )));
        }
    }
    Ok(())
}

/// Built-in service table, in registration order.
///
/// Each base URL can be overridden with `<NAME>_SERVICE_URL`.
pub fn default_services() -> Vec<ServiceDescriptor> {
    let table: [(&str, u16, &[&str]); 6] = [
        ("auth", 8001, &["/api/v1/auth", "/api/v1/users", "/api/v1/roles"]),
        ("ml", 8002, &["/api/v1/ml", "/api/v1/threats", "/api/v1/risk"]),
        ("storage", 8003, &["/api/v1/storage", "/api/v1/objects"]),
        ("search", 8004, &["/api/v1/search", "/api/v1/logs"]),
        ("timeseries", 8005, &["/api/v1/metrics", "/api/v1/timeseries"]),
        ("replication", 8006, &["/api/v1/replication"]),
    ];

    table
        .iter()
        .map(|(name, port, routes)| {
            let env_key = format!("{}_SERVICE_URL", name.to_uppercase());
            let url = std::env::var(&env_key)
                .unwrap_or_else(|_| format!("http://localhost:{}", port));
            ServiceDescriptor::new(*name, url, routes)
        })
        .collect()
}
