// ============================================================================
// API Gateway
// ============================================================================
//
// Single entry point in front of the backend services. It handles:
// - Rate limiting (global, per IP, per user, per endpoint) with burst credit
// - Request routing by path prefix
// - Round-robin load balancing between service instances
// - Per-instance circuit breaking
//
// Architecture:
// - Stateless apart from breaker state; quotas live in the counter store
//   (Redis, or in-process when REDIS_URL is unset)
// - A failing counter store never blocks traffic (fail-open)
//
// ============================================================================

pub mod circuit_breaker;
pub mod counter_store;
pub mod load_balancer;
pub mod middleware;
pub mod rate_limiter;
pub mod registry;
pub mod router;
pub mod service_client;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use counter_store::{CounterOutcome, CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use load_balancer::{LoadBalancer, ServiceInstance};
pub use rate_limiter::{Clock, ManualClock, RateLimitDecision, RateLimitInfo, RateLimiter, SystemClock};
pub use registry::{RouteTable, ServiceRegistry};
pub use router::GatewayRouter;
pub use service_client::ServiceClient;
