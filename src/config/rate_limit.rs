// ============================================================================
// Rate Limit Policies
// ============================================================================
//
// Per-endpoint policies are looked up by exact path match; everything else
// falls back to the default policy.
//
// ============================================================================

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_REQUESTS: u64 = 100;
const DEFAULT_WINDOW_SECS: u64 = 3600;
const DEFAULT_BURST: u64 = 10;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 500;

/// Longest accepted window (one year)
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Which dimension a quota is counted against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One counter for all callers
    Global,
    /// Counted per client IP
    PerIp,
    /// Counted per `X-User-Id`, falling back to client IP
    PerUser,
    /// Counted per route path
    PerEndpoint,
}

impl RateLimitScope {
    /// Scope segment used in counter keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerIp => "per_ip",
            Self::PerUser => "per_user",
            Self::PerEndpoint => "per_endpoint",
        }
    }
}

/// A single quota policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub requests: u64,
    /// Window length in seconds
    #[serde(alias = "window")]
    pub window_secs: u64,
    /// Extra requests admitted once `requests` is exhausted
    #[serde(default)]
    pub burst: u64,
    #[serde(default = "default_scope")]
    pub scope: RateLimitScope,
}

fn default_scope() -> RateLimitScope {
    RateLimitScope::PerIp
}

impl RateLimitConfig {
    pub fn new(requests: u64, window_secs: u64, burst: u64, scope: RateLimitScope) -> Self {
        Self {
            requests,
            window_secs,
            burst,
            scope,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.requests == 0 {
            return Err(AppError::config("rate limit requests must be greater than zero"));
        }
        if self.window_secs == 0 {
            return Err(AppError::config("rate limit window must be greater than zero"));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(AppError::config(format!(
                "rate limit window must be at most {} seconds, got {}",
                MAX_WINDOW_SECS, self.window_secs
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_REQUESTS,
            DEFAULT_WINDOW_SECS,
            DEFAULT_BURST,
            RateLimitScope::PerIp,
        )
    }
}

/// Rate limiting configuration
#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    /// Policy for routes without an exact entry in `endpoints`
    pub default: RateLimitConfig,
    /// Exact-path policies
    pub endpoints: HashMap<String, RateLimitConfig>,
    /// Upper bound on one counter store round trip before failing open
    pub store_timeout: Duration,
}

impl RateLimitSettings {
    pub(crate) fn from_env() -> Self {
        let fallback = RateLimitConfig::default();
        let default = RateLimitConfig {
            requests: std::env::var("RATE_LIMIT_DEFAULT_REQUESTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback.requests),
            window_secs: std::env::var("RATE_LIMIT_DEFAULT_WINDOW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback.window_secs),
            burst: std::env::var("RATE_LIMIT_DEFAULT_BURST")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback.burst),
            scope: fallback.scope,
        };

        Self {
            default,
            endpoints: default_endpoint_limits(),
            store_timeout: Duration::from_millis(
                std::env::var("COUNTER_STORE_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
        }
    }

    /// Policy for a path, and whether it came from the endpoint table
    pub fn policy_for(&self, path: &str) -> (&RateLimitConfig, bool) {
        match self.endpoints.get(path) {
            Some(policy) => (policy, true),
            None => (&self.default, false),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        self.default.validate()?;
        for (route, policy) in &self.endpoints {
            if !route.starts_with('/') {
                return Err(AppError::config(format!(
                    "rate limit route '{}' must start with '/'",
                    route
                )));
            }
            policy
                .validate()
                .map_err(|e| AppError::config(format!("rate limit for '{}': {}", route, e)))?;
        }
        Ok(())
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default: RateLimitConfig::default(),
            endpoints: default_endpoint_limits(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

/// Stricter quotas for credential and analytics endpoints
pub fn default_endpoint_limits() -> HashMap<String, RateLimitConfig> {
    HashMap::from([
        (
            "/api/v1/auth/login".to_string(),
            RateLimitConfig::new(5, 300, 2, RateLimitScope::PerIp),
        ),
        (
            "/api/v1/auth/register".to_string(),
            RateLimitConfig::new(3, 3600, 0, RateLimitScope::PerIp),
        ),
        (
            "/api/v1/ml/analyze".to_string(),
            RateLimitConfig::new(50, 3600, 10, RateLimitScope::PerUser),
        ),
        (
            "/api/v1/search".to_string(),
            RateLimitConfig::new(600, 60, 100, RateLimitScope::PerUser),
        ),
        (
            "/api/v1/replication/sync".to_string(),
            RateLimitConfig::new(10, 60, 0, RateLimitScope::Global),
        ),
    ])
}
