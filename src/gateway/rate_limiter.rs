// ============================================================================
// Rate Limiter
// ============================================================================
//
// Admission control in front of every proxied request.
//
// Counters are keyed by fixed time bucket:
//
//     scope:identifier[:route]:floor(now / window)
//
// Within a bucket a caller gets `requests` admissions plus `burst` extra
// ones. Buckets do not slide, so a caller can spend a full quota at the end
// of one bucket and again at the start of the next.
//
// If the counter store is unreachable the request is admitted without
// rate limit headers (fail-open).
//
// ============================================================================

use crate::config::{RateLimitConfig, RateLimitScope, RateLimitSettings};
use crate::gateway::counter_store::CounterStore;
use crate::utils::{extract_client_ip, extract_user_id};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_BURST_REMAINING: &str = "x-ratelimit-burst-remaining";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Wall clock in whole seconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(now_secs),
        }
    }

    pub fn set(&self, now_secs: u64) {
        self.now.store(now_secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Quota state reported back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub burst_remaining: u64,
    /// Epoch seconds at which the current bucket ends
    pub reset: u64,
    /// Seconds until the bucket ends, at least 1
    pub retry_after: u64,
}

impl RateLimitInfo {
    /// Write the `X-RateLimit-*` headers; `Retry-After` only on denial
    pub fn apply_headers(&self, headers: &mut HeaderMap, denied: bool) {
        let mut set = |name: &'static str, value: u64| {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        };

        set(HEADER_LIMIT, self.limit);
        set(HEADER_REMAINING, self.remaining);
        set(HEADER_RESET, self.reset);
        set(HEADER_BURST_REMAINING, self.burst_remaining);
        if denied {
            set(HEADER_RETRY_AFTER, self.retry_after);
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Admitted. `None` when the counter store was unavailable.
    Allowed(Option<RateLimitInfo>),
    Denied(RateLimitInfo),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::Allowed(info) => info.as_ref(),
            Self::Denied(info) => Some(info),
        }
    }
}

/// Identity a quota is counted against
pub fn resolve_identifier(
    scope: RateLimitScope,
    path: &str,
    headers: &HeaderMap,
    client_ip: Option<IpAddr>,
) -> String {
    match scope {
        RateLimitScope::Global => "global".to_string(),
        RateLimitScope::PerIp => extract_client_ip(headers, client_ip),
        RateLimitScope::PerUser => {
            extract_user_id(headers).unwrap_or_else(|| extract_client_ip(headers, client_ip))
        }
        RateLimitScope::PerEndpoint => path.to_string(),
    }
}

/// Counter key for one fixed time bucket
pub fn bucket_key(
    scope: RateLimitScope,
    identifier: &str,
    route: Option<&str>,
    bucket: u64,
) -> String {
    match route {
        Some(route) => format!("{}:{}:{}:{}", scope.as_str(), identifier, route, bucket),
        None => format!("{}:{}:{}", scope.as_str(), identifier, bucket),
    }
}

/// Fixed-bucket rate limiter with burst allowance
pub struct RateLimiter {
    settings: RateLimitSettings,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(settings, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: RateLimitSettings,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            clock,
        }
    }

    /// Policy applied to `path`
    pub fn policy_for(&self, path: &str) -> &RateLimitConfig {
        self.settings.policy_for(path).0
    }

    /// Check and count one request
    pub async fn check(
        &self,
        path: &str,
        headers: &HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> RateLimitDecision {
        let (policy, from_table) = self.settings.policy_for(path);
        let identifier = resolve_identifier(policy.scope, path, headers, client_ip);

        let now = self.clock.now_secs();
        let bucket = now / policy.window_secs;
        // Route-specific quotas are counted apart from the default quota
        let route = (from_table && policy.scope != RateLimitScope::PerEndpoint).then_some(path);
        let key = bucket_key(policy.scope, &identifier, route, bucket);

        let result = tokio::time::timeout(
            self.settings.store_timeout,
            self.store
                .check_and_increment(&key, policy.requests, policy.burst, policy.window_secs),
        )
        .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, key = %key, "Counter store unavailable, allowing request");
                return RateLimitDecision::Allowed(None);
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    timeout_ms = self.settings.store_timeout.as_millis() as u64,
                    "Counter store timed out, allowing request"
                );
                return RateLimitDecision::Allowed(None);
            }
        };

        let reset = bucket.saturating_add(1).saturating_mul(policy.window_secs);
        let info = RateLimitInfo {
            limit: policy.requests,
            remaining: policy.requests.saturating_sub(outcome.count),
            burst_remaining: policy.burst.saturating_sub(outcome.burst_count),
            reset,
            retry_after: reset.saturating_sub(now).max(1),
        };

        if outcome.admitted {
            RateLimitDecision::Allowed(Some(info))
        } else {
            tracing::debug!(
                key = %key,
                limit = policy.requests,
                burst = policy.burst,
                "Rate limit exceeded"
            );
            RateLimitDecision::Denied(RateLimitInfo {
                remaining: 0,
                burst_remaining: 0,
                ..info
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::gateway::counter_store::{CounterOutcome, InMemoryCounterStore, RedisCounterStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn check_and_increment(&self, _: &str, _: u64, _: u64, _: u64) -> AppResult<CounterOutcome> {
            Err(AppError::counter_store("connection refused"))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn check_and_increment(&self, _: &str, _: u64, _: u64, _: u64) -> AppResult<CounterOutcome> {
            std::future::pending().await
        }
    }

    fn settings(default: RateLimitConfig) -> RateLimitSettings {
        RateLimitSettings {
            default,
            endpoints: HashMap::new(),
            store_timeout: Duration::from_millis(200),
        }
    }

    fn limiter(default: RateLimitConfig, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::with_clock(settings(default), Arc::new(InMemoryCounterStore::new()), clock)
    }

    #[tokio::test]
    async fn test_burst_boundary() {
        let (r, w, b) = (5, 60, 3);
        let clock = Arc::new(ManualClock::new(1_000_020));
        let limiter = limiter(RateLimitConfig::new(r, w, b, RateLimitScope::Global), clock);
        let headers = HeaderMap::new();

        for i in 1..=r {
            let decision = limiter.check("/api/v1/x", &headers, None).await;
            let info = decision.info().unwrap().clone();
            assert!(decision.is_allowed());
            assert_eq!(info.remaining, r - i);
            assert_eq!(info.burst_remaining, b);
        }
        for i in 1..=b {
            let decision = limiter.check("/api/v1/x", &headers, None).await;
            assert!(decision.is_allowed(), "burst request {} should be admitted", i);
            assert_eq!(decision.info().unwrap().remaining, 0);
            assert_eq!(decision.info().unwrap().burst_remaining, b - i);
        }

        match limiter.check("/api/v1/x", &headers, None).await {
            RateLimitDecision::Denied(info) => {
                assert_eq!(info.limit, r);
                assert_eq!(info.remaining, 0);
                // now sits exactly on the start of bucket [1_000_020, 1_000_080)
                assert_eq!(info.reset, 1_000_080);
                assert_eq!(info.retry_after, 60);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_after_window() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = limiter(
            RateLimitConfig::new(2, 100, 0, RateLimitScope::PerIp),
            clock.clone(),
        );
        let headers = HeaderMap::new();
        let ip: Option<IpAddr> = Some("192.0.2.10".parse().unwrap());

        assert!(limiter.check("/a", &headers, ip).await.is_allowed());
        assert!(limiter.check("/a", &headers, ip).await.is_allowed());
        assert!(!limiter.check("/a", &headers, ip).await.is_allowed());

        clock.advance(100);
        let decision = limiter.check("/a", &headers, ip).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.info().unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_fixed_bucket_allows_double_burst_at_boundary() {
        let clock = Arc::new(ManualClock::new(159));
        let limiter = limiter(
            RateLimitConfig::new(3, 60, 0, RateLimitScope::Global),
            clock.clone(),
        );
        let headers = HeaderMap::new();

        for _ in 0..3 {
            assert!(limiter.check("/a", &headers, None).await.is_allowed());
        }
        clock.advance(1);
        for _ in 0..3 {
            assert!(limiter.check("/a", &headers, None).await.is_allowed());
        }
        assert!(!limiter.check("/a", &headers, None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_per_ip_identities_are_separate() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(RateLimitConfig::new(1, 60, 0, RateLimitScope::PerIp), clock);

        let mut a = HeaderMap::new();
        a.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        let mut b = HeaderMap::new();
        b.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.2"));

        assert!(limiter.check("/a", &a, None).await.is_allowed());
        assert!(!limiter.check("/a", &a, None).await.is_allowed());
        assert!(limiter.check("/a", &b, None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_endpoint_policy_counted_separately_from_default() {
        let clock = Arc::new(ManualClock::new(0));
        let mut settings = settings(RateLimitConfig::new(1, 60, 0, RateLimitScope::Global));
        settings.endpoints.insert(
            "/api/v1/auth/login".to_string(),
            RateLimitConfig::new(1, 60, 0, RateLimitScope::Global),
        );
        let limiter =
            RateLimiter::with_clock(settings, Arc::new(InMemoryCounterStore::new()), clock);
        let headers = HeaderMap::new();

        assert!(limiter.check("/api/v1/auth/login", &headers, None).await.is_allowed());
        assert!(limiter.check("/api/v1/other", &headers, None).await.is_allowed());
        assert!(!limiter.check("/api/v1/auth/login", &headers, None).await.is_allowed());
        assert!(!limiter.check("/api/v1/other", &headers, None).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let limiter = RateLimiter::new(
            settings(RateLimitConfig::new(1, 60, 0, RateLimitScope::Global)),
            Arc::new(FailingStore),
        );
        for _ in 0..5 {
            assert_eq!(
                limiter.check("/a", &HeaderMap::new(), None).await,
                RateLimitDecision::Allowed(None)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_open_on_store_timeout() {
        let limiter = RateLimiter::new(
            settings(RateLimitConfig::new(1, 60, 0, RateLimitScope::Global)),
            Arc::new(HangingStore),
        );
        assert_eq!(
            limiter.check("/a", &HeaderMap::new(), None).await,
            RateLimitDecision::Allowed(None)
        );
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter(
            RateLimitConfig::new(1, u64::MAX / 2, 0, RateLimitScope::Global),
            clock,
        );
        let headers = HeaderMap::new();

        let decision = limiter.check("/api/v1/x", &headers, None).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.info().unwrap().reset, u64::MAX / 2);

        let decision = limiter.check("/api/v1/x", &headers, None).await;
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_open_without_waiting() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let store = RedisCounterStore::new(&format!("redis://127.0.0.1:{}", port))
            .unwrap()
            .with_connect_timeout(Duration::from_millis(100));
        let mut settings = settings(RateLimitConfig::new(1, 60, 0, RateLimitScope::Global));
        settings.store_timeout = Duration::from_millis(500);
        let limiter = RateLimiter::with_clock(
            settings,
            Arc::new(store),
            Arc::new(ManualClock::new(1_000_000)),
        );
        let headers = HeaderMap::new();

        // First call pays at most the connect timeout
        let started = std::time::Instant::now();
        let decision = limiter.check("/api/v1/x", &headers, None).await;
        assert_eq!(decision, RateLimitDecision::Allowed(None));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Later calls fail open straight away while the store backs off
        let started = std::time::Instant::now();
        for _ in 0..4 {
            let decision = limiter.check("/api/v1/x", &headers, None).await;
            assert_eq!(decision, RateLimitDecision::Allowed(None));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_resolve_identifier() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.9"));
        let socket: Option<IpAddr> = Some("127.0.0.1".parse().unwrap());

        assert_eq!(resolve_identifier(RateLimitScope::Global, "/p", &headers, socket), "global");
        assert_eq!(resolve_identifier(RateLimitScope::PerIp, "/p", &headers, socket), "198.51.100.9");
        assert_eq!(resolve_identifier(RateLimitScope::PerUser, "/p", &headers, socket), "198.51.100.9");
        assert_eq!(resolve_identifier(RateLimitScope::PerEndpoint, "/p", &headers, socket), "/p");

        headers.insert("x-user-id", HeaderValue::from_static("u-42"));
        assert_eq!(resolve_identifier(RateLimitScope::PerUser, "/p", &headers, socket), "u-42");
        assert_eq!(resolve_identifier(RateLimitScope::PerIp, "/p", &HeaderMap::new(), socket), "127.0.0.1");
    }

    #[test]
    fn test_bucket_key_format() {
        assert_eq!(
            bucket_key(RateLimitScope::PerIp, "10.0.0.1", None, 7),
            "per_ip:10.0.0.1:7"
        );
        assert_eq!(
            bucket_key(RateLimitScope::PerUser, "u-1", Some("/api/v1/ml/analyze"), 3),
            "per_user:u-1:/api/v1/ml/analyze:3"
        );
    }

    #[test]
    fn test_headers() {
        let info = RateLimitInfo {
            limit: 100,
            remaining: 0,
            burst_remaining: 0,
            reset: 1_700_000_000,
            retry_after: 42,
        };

        let mut headers = HeaderMap::new();
        info.apply_headers(&mut headers, false);
        assert_eq!(headers[HEADER_LIMIT], "100");
        assert_eq!(headers[HEADER_RESET], "1700000000");
        assert!(headers.get(HEADER_RETRY_AFTER).is_none());

        info.apply_headers(&mut headers, true);
        assert_eq!(headers[HEADER_RETRY_AFTER], "42");
        assert_eq!(headers[HEADER_REMAINING], "0");
    }
}
