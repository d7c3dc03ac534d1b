use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::AppResult;

pub mod logging;
pub mod rate_limit;
pub mod services;

pub use logging::{LogFormat, LoggingConfig};
pub use rate_limit::{RateLimitConfig, RateLimitScope, RateLimitSettings};
pub use services::{default_services, validate_services, ServiceDescriptor};

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for a single health probe
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Configuration Structures
// ============================================================================

/// Circuit breaker configuration for backend instances
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit (default: 5)
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed (default: 60)
    pub recovery_timeout_secs: u64,
}

impl CircuitBreakerConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            failure_threshold: std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            recovery_timeout_secs: std::env::var("CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Redis URL for the shared counter store. `None` keeps counters in-process.
    pub redis_url: Option<String>,
    /// Largest request body the proxy will buffer
    pub max_body_bytes: usize,
    /// Background health probe interval; 0 disables the monitor
    pub health_check_interval_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitSettings,
    /// Backend services in registration order
    pub services: Vec<ServiceDescriptor>,
    pub logging: LoggingConfig,
}

/// Shape of the optional GATEWAY_SERVICES_FILE
#[derive(Debug, Default, Deserialize)]
struct GatewayFile {
    #[serde(default)]
    services: Option<Vec<ServiceDescriptor>>,
    #[serde(default)]
    rate_limits: Option<RateLimitFile>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitFile {
    #[serde(default)]
    default: Option<RateLimitConfig>,
    #[serde(default)]
    endpoints: HashMap<String, RateLimitConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self {
            port: std::env::var("GATEWAY_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            max_body_bytes: std::env::var("GATEWAY_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_BODY_BYTES),
            health_check_interval_secs: std::env::var("HEALTH_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            rate_limit: RateLimitSettings::from_env(),
            services: default_services(),
            logging: LoggingConfig::from_env(),
        };

        if let Ok(path) = std::env::var("GATEWAY_SERVICES_FILE") {
            config
                .apply_file(Path::new(&path))
                .with_context(|| format!("Failed to load gateway file {}", path))?;
        }

        config.validate().context("Invalid gateway configuration")?;
        Ok(config)
    }

    /// Configuration for an explicit service table, everything else default
    pub fn with_services(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            services,
            ..Self::default()
        }
    }

    fn apply_file(&mut self, path: &Path) -> AppResult<()> {
        let raw = std::fs::read_to_string(path)?;
        let file: GatewayFile = serde_json::from_str(&raw)?;

        if let Some(services) = file.services {
            self.services = services;
        }
        if let Some(rate_limits) = file.rate_limits {
            if let Some(default) = rate_limits.default {
                self.rate_limit.default = default;
            }
            self.rate_limit.endpoints.extend(rate_limits.endpoints);
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        validate_services(&self.services)?;
        self.rate_limit.validate()?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(crate::error::AppError::config(
                "circuit breaker failure threshold must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            redis_url: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            health_check_interval_secs: 0,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitSettings::default(),
            services: default_services(),
            logging: LoggingConfig::default(),
        }
    }
}
