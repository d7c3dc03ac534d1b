// ============================================================================
// Load Balancer
// ============================================================================
//
// Round-robin over the instances of one logical service, skipping instances
// whose circuit breaker refuses traffic. The topology is static: instances
// are added while the registry is built and never removed.
//
// ============================================================================

use crate::config::CircuitBreakerConfig;
use crate::gateway::circuit_breaker::CircuitBreaker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One network endpoint backing a service
#[derive(Debug)]
pub struct ServiceInstance {
    url: String,
    breaker: CircuitBreaker,
}

impl ServiceInstance {
    pub fn new(url: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        let breaker = CircuitBreaker::new(url.clone(), config);
        Self { url, breaker }
    }

    /// Base URL, without a trailing slash
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Round-robin load balancer for one service
#[derive(Debug)]
pub struct LoadBalancer {
    instances: Vec<Arc<ServiceInstance>>,
    breaker_config: CircuitBreakerConfig,
    current_index: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            instances: Vec::new(),
            breaker_config,
            current_index: AtomicUsize::new(0),
        }
    }

    /// Append an instance; it gets its own circuit breaker
    pub fn add_instance(&mut self, url: impl Into<String>) {
        self.instances
            .push(Arc::new(ServiceInstance::new(url, &self.breaker_config)));
    }

    pub fn instances(&self) -> &[Arc<ServiceInstance>] {
        &self.instances
    }

    /// Next instance whose breaker allows a request, or `None` when every
    /// circuit is open. The cursor advances on each candidate examined.
    pub async fn get_next_instance(&self) -> Option<Arc<ServiceInstance>> {
        let len = self.instances.len();
        if len == 0 {
            return None;
        }

        for _ in 0..len {
            let index = self.advance_cursor(len);
            let candidate = &self.instances[index];
            if candidate.breaker.can_execute().await {
                return Some(Arc::clone(candidate));
            }
        }

        None
    }

    /// Returns the current cursor and moves it one step, wrapping at `len`
    fn advance_cursor(&self, len: usize) -> usize {
        // fetch_update only fails when the closure returns None
        match self
            .current_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
        {
            Ok(previous) | Err(previous) => previous % len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn balancer(urls: &[&str]) -> LoadBalancer {
        let mut lb = LoadBalancer::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
        });
        for url in urls {
            lb.add_instance(*url);
        }
        lb
    }

    #[tokio::test]
    async fn test_empty_balancer_returns_none() {
        let lb = balancer(&[]);
        assert!(lb.get_next_instance().await.is_none());
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let lb = balancer(&["http://a:1", "http://b:2", "http://c:3"]);
        let rounds = 4;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..rounds * 3 {
            let instance = lb.get_next_instance().await.unwrap();
            *counts.entry(instance.url().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == rounds));
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let lb = balancer(&["http://a:1", "http://b:2"]);
        assert_eq!(lb.get_next_instance().await.unwrap().url(), "http://a:1");
        assert_eq!(lb.get_next_instance().await.unwrap().url(), "http://b:2");
        assert_eq!(lb.get_next_instance().await.unwrap().url(), "http://a:1");
    }

    #[tokio::test]
    async fn test_skips_open_circuit() {
        let lb = balancer(&["http://a:1", "http://b:2"]);
        lb.instances()[0].breaker().record_failure().await;

        for _ in 0..10 {
            let instance = lb.get_next_instance().await.unwrap();
            assert_eq!(instance.url(), "http://b:2");
        }
    }

    #[tokio::test]
    async fn test_all_open_returns_none() {
        let lb = balancer(&["http://a:1", "http://b:2"]);
        for instance in lb.instances() {
            instance.breaker().record_failure().await;
        }
        assert!(lb.get_next_instance().await.is_none());
    }

    #[tokio::test]
    async fn test_cursor_stays_in_range() {
        let lb = balancer(&["http://a:1", "http://b:2", "http://c:3"]);
        for _ in 0..50 {
            lb.get_next_instance().await;
            assert!(lb.current_index.load(Ordering::Acquire) < 3);
        }
    }

    #[test]
    fn test_instance_url_is_normalized() {
        let instance = ServiceInstance::new("http://a:1/", &CircuitBreakerConfig::default());
        assert_eq!(instance.url(), "http://a:1");
    }
}
