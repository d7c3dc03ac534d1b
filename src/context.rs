use crate::config::Config;
use crate::error::AppResult;
use crate::gateway::counter_store::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use crate::gateway::rate_limiter::RateLimiter;
use crate::gateway::registry::ServiceRegistry;
use crate::gateway::service_client::ServiceClient;
use std::sync::Arc;

/// Gateway context containing shared dependencies.
///
/// Built once by the entry point and handed to every handler as router
/// state; nothing in the gateway lives in process-wide statics except the
/// Prometheus counters.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub registry: Arc<ServiceRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub service_client: ServiceClient,
}

impl GatewayContext {
    /// Build every component from configuration.
    ///
    /// Counters go to Redis when `redis_url` is set, otherwise they stay in
    /// this process.
    pub fn from_config(config: Config) -> AppResult<Self> {
        let store: Arc<dyn CounterStore> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisCounterStore::new(url)?
                    .with_connect_timeout(config.rate_limit.store_timeout / 2),
            ),
            None => {
                tracing::warn!("REDIS_URL not set, rate limit counters are local to this process");
                Arc::new(InMemoryCounterStore::new())
            }
        };
        let rate_limiter = RateLimiter::new(config.rate_limit.clone(), store);
        Self::with_rate_limiter(config, rate_limiter)
    }

    /// Build with an explicit rate limiter (custom store or clock)
    pub fn with_rate_limiter(config: Config, rate_limiter: RateLimiter) -> AppResult<Self> {
        config.validate()?;

        let service_client = ServiceClient::new()?;
        let registry = ServiceRegistry::from_config(&config, service_client.http().clone())?;

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            rate_limiter: Arc::new(rate_limiter),
            service_client,
        })
    }
}
