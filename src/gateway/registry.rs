// ============================================================================
// Service Registry
// ============================================================================
//
// Static service discovery: one load balancer per logical service plus the
// route table mapping path prefixes to services.
//
// Route resolution is first-match in registration order. When two services
// declare overlapping prefixes, the service registered first wins even if
// the other prefix is more specific.
//
// Health probes are informational: they never open breakers or take
// instances out of rotation. Only live proxy failures do that.
//
// ============================================================================

use crate::config::{CircuitBreakerConfig, Config, ServiceDescriptor, HEALTH_CHECK_TIMEOUT};
use crate::error::{AppError, AppResult};
use crate::gateway::circuit_breaker::CircuitBreakerSnapshot;
use crate::gateway::load_balancer::{LoadBalancer, ServiceInstance};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Prefix → service name, in registration order
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    entries: Vec<(String, String)>,
}

impl RouteTable {
    fn push(&mut self, prefix: &str, service: &str) {
        self.entries.push((prefix.to_string(), service.to_string()));
    }

    /// First entry whose prefix is a string prefix of `path`
    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, service)| service.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RegisteredService {
    descriptor: ServiceDescriptor,
    balancer: LoadBalancer,
}

/// Registry of backend services
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
    index: HashMap<String, usize>,
    routes: RouteTable,
    breaker_config: CircuitBreakerConfig,
    http: reqwest::Client,
}

impl ServiceRegistry {
    pub fn new(http: reqwest::Client, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            routes: RouteTable::default(),
            breaker_config,
            http,
        }
    }

    /// Build the registry from validated configuration
    pub fn from_config(config: &Config, http: reqwest::Client) -> AppResult<Self> {
        let mut registry = Self::new(http, config.circuit_breaker.clone());
        for descriptor in &config.services {
            registry.register(descriptor.clone())?;
        }
        Ok(registry)
    }

    /// Register a service; its prefixes are appended to the route table
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> AppResult<()> {
        descriptor.validate()?;
        if self.index.contains_key(&descriptor.name) {
            return Err(AppError::config(format!(
                "service '{}' is already registered",
                descriptor.name
            )));
        }

        let mut balancer = LoadBalancer::new(self.breaker_config.clone());
        for url in &descriptor.urls {
            balancer.add_instance(url.as_str());
        }
        for prefix in &descriptor.routes {
            self.routes.push(prefix, &descriptor.name);
        }

        info!(
            service = %descriptor.name,
            instances = descriptor.urls.len(),
            routes = ?descriptor.routes,
            "Registered backend service"
        );

        self.index
            .insert(descriptor.name.clone(), self.services.len());
        self.services.push(RegisteredService {
            descriptor,
            balancer,
        });
        Ok(())
    }

    /// Service owning `path`, if any
    pub fn get_service_for_route(&self, path: &str) -> Option<&str> {
        self.routes.resolve(path)
    }

    /// Next available instance of a service, or `None` if the service is
    /// unknown or every instance's circuit is open
    pub async fn get_service_url(&self, service_name: &str) -> Option<Arc<ServiceInstance>> {
        let service = self.get(service_name)?;
        service.balancer.get_next_instance().await
    }

    pub fn descriptor(&self, service_name: &str) -> Option<&ServiceDescriptor> {
        self.get(service_name).map(|s| &s.descriptor)
    }

    /// Service names in registration order
    pub fn service_names(&self) -> Vec<&str> {
        self.services
            .iter()
            .map(|s| s.descriptor.name.as_str())
            .collect()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn get(&self, service_name: &str) -> Option<&RegisteredService> {
        self.index.get(service_name).map(|&i| &self.services[i])
    }

    /// Probe a service's health endpoint.
    ///
    /// The service is healthy when at least one instance answers 2xx within
    /// the probe timeout.
    pub async fn health_check_service(&self, service_name: &str) -> bool {
        let Some(service) = self.get(service_name) else {
            return false;
        };

        let probes = service
            .balancer
            .instances()
            .iter()
            .map(|instance| self.probe(instance.url(), &service.descriptor.health_path));

        join_all(probes).await.into_iter().any(|healthy| healthy)
    }

    /// Probe every service concurrently
    pub async fn health_check_all_services(&self) -> BTreeMap<String, bool> {
        let checks = self.services.iter().map(|service| async move {
            let name = service.descriptor.name.clone();
            let healthy = self.health_check_service(&name).await;
            (name, healthy)
        });

        join_all(checks).await.into_iter().collect()
    }

    async fn probe(&self, base_url: &str, health_path: &str) -> bool {
        let health_url = format!("{}{}", base_url, health_path);
        match self
            .http
            .get(&health_url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %health_url, error = %e, "Service health check failed");
                false
            }
        }
    }

    /// Breaker state of every instance, grouped by service
    pub async fn breaker_snapshot(
        &self,
    ) -> BTreeMap<String, BTreeMap<String, CircuitBreakerSnapshot>> {
        let mut snapshot = BTreeMap::new();
        for service in &self.services {
            let mut instances = BTreeMap::new();
            for instance in service.balancer.instances() {
                instances.insert(
                    instance.url().to_string(),
                    instance.breaker().snapshot().await,
                );
            }
            snapshot.insert(service.descriptor.name.clone(), instances);
        }
        snapshot
    }

    /// Periodically probe all services and log health transitions
    pub fn spawn_health_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last: BTreeMap<String, bool> = BTreeMap::new();

            loop {
                ticker.tick().await;
                let current = self.health_check_all_services().await;

                for (name, healthy) in &current {
                    match (last.get(name).copied(), *healthy) {
                        (Some(true) | None, false) => {
                            warn!(service = %name, "Backend service health check failing")
                        }
                        (Some(false), true) => {
                            info!(service = %name, "Backend service health check recovered")
                        }
                        _ => {}
                    }
                }
                last = current;
            }
        })
    }
}
