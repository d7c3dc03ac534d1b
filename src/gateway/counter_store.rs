// ============================================================================
// Counter Store
// ============================================================================
//
// Atomic check-and-increment of rate limit counters.
//
// - RedisCounterStore: shared across gateway processes. A Lua script reads
//   both sub-counters and increments at most one of them in a single round
//   trip, so concurrent requests can never overrun the quota.
// - InMemoryCounterStore: per-process counters for single-node deployments
//   and tests.
//
// Errors mean the store could not be reached; a missing key is simply a
// zero count.
//
// ============================================================================

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const REDIS_KEY_PREFIX: &str = "ratelimit:";
const MEMORY_SWEEP_EVERY: u64 = 256;
const MEMORY_MAX_TTL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Counter values after one check-and-increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// Whether one unit of quota (primary or burst) was consumed
    pub admitted: bool,
    /// Primary counter after the operation
    pub count: u64,
    /// Burst counter after the operation
    pub burst_count: u64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically: if the primary counter for `key` is below `limit`,
    /// increment it; otherwise if the burst counter is below `burst`,
    /// increment that; otherwise change nothing. Incremented counters
    /// expire after `ttl_secs`.
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        burst: u64,
        ttl_secs: u64,
    ) -> AppResult<CounterOutcome>;
}

// ============================================================================
// Redis
// ============================================================================

const CHECK_AND_INCREMENT_SCRIPT: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local burst = tonumber(redis.call('GET', KEYS[2]) or '0')
local limit = tonumber(ARGV[1])
local burst_limit = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
if count < limit then
    count = redis.call('INCR', KEYS[1])
    redis.call('EXPIRE', KEYS[1], ttl)
    return {1, count, burst}
end
if burst < burst_limit then
    burst = redis.call('INCR', KEYS[2])
    redis.call('EXPIRE', KEYS[2], ttl)
    return {1, count, burst}
end
return {0, count, burst}
";

/// Upper bound on a single connect attempt
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
/// How long a failed connect short-circuits further attempts
const REDIS_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RedisConnState {
    conn: Option<ConnectionManager>,
    unavailable_until: Option<Instant>,
}

/// Redis-backed counters with lazy connection
///
/// While Redis is unreachable, calls fail immediately for
/// `REDIS_RETRY_BACKOFF` instead of each one paying for a connect attempt.
pub struct RedisCounterStore {
    client: redis::Client,
    state: Mutex<RedisConnState>,
    script: redis::Script,
    connect_timeout: Duration,
    retry_backoff: Duration,
}

impl RedisCounterStore {
    /// Parse the URL; the connection itself is opened on first use so the
    /// gateway can start while Redis is down
    pub fn new(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            state: Mutex::new(RedisConnState::default()),
            script: redis::Script::new(CHECK_AND_INCREMENT_SCRIPT),
            connect_timeout: REDIS_CONNECT_TIMEOUT,
            retry_backoff: REDIS_RETRY_BACKOFF,
        })
    }

    /// Cap a connect attempt at `timeout` (kept below the store timeout)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connection(&self) -> AppResult<ConnectionManager> {
        {
            let state = self.state.lock().await;
            if let Some(conn) = state.conn.as_ref() {
                return Ok(conn.clone());
            }
            if let Some(until) = state.unavailable_until {
                if Instant::now() < until {
                    return Err(AppError::counter_store("redis unavailable, backing off"));
                }
            }
        }

        // Connect without holding the lock
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(self.connect_timeout);
        let result = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new_with_config(self.client.clone(), config),
        )
        .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(Ok(conn)) => {
                tracing::info!("Connected to Redis counter store");
                // Another task may have won the race
                let conn = state.conn.get_or_insert(conn).clone();
                state.unavailable_until = None;
                Ok(conn)
            }
            Ok(Err(e)) => {
                self.mark_unavailable(&mut state);
                Err(e.into())
            }
            Err(_) => {
                self.mark_unavailable(&mut state);
                Err(AppError::counter_store("redis connect timed out"))
            }
        }
    }

    fn mark_unavailable(&self, state: &mut RedisConnState) {
        if state.unavailable_until.is_none() {
            tracing::warn!(
                backoff_secs = self.retry_backoff.as_secs(),
                "Redis counter store unreachable"
            );
        }
        state.unavailable_until = Some(Instant::now() + self.retry_backoff);
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        burst: u64,
        ttl_secs: u64,
    ) -> AppResult<CounterOutcome> {
        let mut conn = self.connection().await?;
        let primary_key = format!("{}{}", REDIS_KEY_PREFIX, key);
        let burst_key = format!("{}:burst", primary_key);

        let result: redis::RedisResult<(i64, i64, i64)> = self
            .script
            .key(&primary_key)
            .key(&burst_key)
            .arg(limit)
            .arg(burst)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await;

        let (admitted, count, burst_count) = match result {
            Ok(values) => values,
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    let mut state = self.state.lock().await;
                    state.conn = None;
                    self.mark_unavailable(&mut state);
                }
                return Err(e.into());
            }
        };

        Ok(CounterOutcome {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            burst_count: burst_count.max(0) as u64,
        })
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug)]
struct MemoryEntry {
    count: u64,
    burst_count: u64,
    expires_at: Instant,
}

/// Process-local counters
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    calls: std::sync::atomic::AtomicU64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or(now + MEMORY_MAX_TTL)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        burst: u64,
        ttl_secs: u64,
    ) -> AppResult<CounterOutcome> {
        let now = Instant::now();
        let ttl = Duration::from_secs(ttl_secs);
        let mut entries = self.entries.lock().await;

        let calls = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if calls % MEMORY_SWEEP_EVERY == 0 {
            entries.retain(|_, e| e.expires_at > now);
        }

        let entry = entries.entry(key.to_string()).or_insert(MemoryEntry {
            count: 0,
            burst_count: 0,
            expires_at: expiry(now, ttl),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.burst_count = 0;
        }

        let admitted = if entry.count < limit {
            entry.count += 1;
            true
        } else if entry.burst_count < burst {
            entry.burst_count += 1;
            true
        } else {
            false
        };
        if admitted {
            entry.expires_at = expiry(now, ttl);
        }

        Ok(CounterOutcome {
            admitted,
            count: entry.count,
            burst_count: entry.burst_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_primary_then_burst_then_deny() {
        let store = InMemoryCounterStore::new();

        for expected in 1..=2 {
            let outcome = store.check_and_increment("k", 2, 1, 60).await.unwrap();
            assert!(outcome.admitted);
            assert_eq!(outcome.count, expected);
            assert_eq!(outcome.burst_count, 0);
        }

        let outcome = store.check_and_increment("k", 2, 1, 60).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.burst_count, 1);

        let outcome = store.check_and_increment("k", 2, 1, 60).await.unwrap();
        assert_eq!(
            outcome,
            CounterOutcome {
                admitted: false,
                count: 2,
                burst_count: 1
            }
        );
    }

    #[tokio::test]
    async fn test_memory_keys_are_independent() {
        let store = InMemoryCounterStore::new();
        store.check_and_increment("a", 1, 0, 60).await.unwrap();

        assert!(!store.check_and_increment("a", 1, 0, 60).await.unwrap().admitted);
        assert!(store.check_and_increment("b", 1, 0, 60).await.unwrap().admitted);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_entries_expire() {
        let store = InMemoryCounterStore::new();
        store.check_and_increment("k", 1, 0, 10).await.unwrap();
        assert!(!store.check_and_increment("k", 1, 0, 10).await.unwrap().admitted);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.is_empty().await);
        let outcome = store.check_and_increment("k", 1, 0, 10).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 1);
    }

    #[tokio::test]
    async fn test_memory_concurrent_increments_never_overrun() {
        let store = std::sync::Arc::new(InMemoryCounterStore::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .check_and_increment("shared", 20, 5, 60)
                        .await
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }

    #[test]
    fn test_redis_store_rejects_bad_url() {
        assert!(RedisCounterStore::new("not a url").is_err());
        assert!(RedisCounterStore::new("redis://127.0.0.1:6379").is_ok());
    }

    // ========================================================================
    // Redis-backed (run with: cargo test counter_store -- --ignored)
    // ========================================================================

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_key(name: &str) -> String {
        format!("test:{}:{}", name, uuid::Uuid::new_v4())
    }

    async fn ttl_of(key: &str) -> i64 {
        let client = redis::Client::open(redis_url()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        redis::cmd("TTL")
            .arg(format!("{}{}", REDIS_KEY_PREFIX, key))
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_primary_then_burst_then_deny() {
        let store = RedisCounterStore::new(&redis_url()).unwrap();
        let key = unique_key("sequence");

        for expected in 1..=2 {
            let outcome = store.check_and_increment(&key, 2, 1, 60).await.unwrap();
            assert!(outcome.admitted);
            assert_eq!(outcome.count, expected);
            assert_eq!(outcome.burst_count, 0);
        }

        let outcome = store.check_and_increment(&key, 2, 1, 60).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 2);
        assert_eq!(outcome.burst_count, 1);

        let outcome = store.check_and_increment(&key, 2, 1, 60).await.unwrap();
        assert_eq!(
            outcome,
            CounterOutcome {
                admitted: false,
                count: 2,
                burst_count: 1
            }
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_burst_key_has_its_own_ttl() {
        let store = RedisCounterStore::new(&redis_url()).unwrap();
        let key = unique_key("ttl");
        let burst_key = format!("{}:burst", key);

        store.check_and_increment(&key, 1, 1, 30).await.unwrap();
        let primary_ttl = ttl_of(&key).await;
        assert!(primary_ttl > 0 && primary_ttl <= 30);
        // -2: key does not exist until burst credit is spent
        assert_eq!(ttl_of(&burst_key).await, -2);

        let outcome = store.check_and_increment(&key, 1, 1, 30).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.burst_count, 1);
        let burst_ttl = ttl_of(&burst_key).await;
        assert!(burst_ttl > 0 && burst_ttl <= 30);

        // A denial touches neither counter
        assert!(!store.check_and_increment(&key, 1, 1, 30).await.unwrap().admitted);
        assert!(ttl_of(&burst_key).await > 0);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_concurrent_increments_never_overrun() {
        let store = std::sync::Arc::new(RedisCounterStore::new(&redis_url()).unwrap());
        let key = unique_key("concurrent");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    store
                        .check_and_increment(&key, 20, 5, 60)
                        .await
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }

    #[tokio::test]
    async fn test_redis_unreachable_backs_off() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let store = RedisCounterStore::new(&format!("redis://127.0.0.1:{}", port))
            .unwrap()
            .with_connect_timeout(Duration::from_millis(100));

        assert!(store.check_and_increment("k", 1, 0, 60).await.is_err());

        let started = std::time::Instant::now();
        for _ in 0..10 {
            let result = store.check_and_increment("k", 1, 0, 60).await;
            assert!(matches!(result, Err(AppError::CounterStore(_))));
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_expiry_saturates() {
        let now = Instant::now();
        let expires = expiry(now, Duration::from_secs(u64::MAX / 2));
        assert_eq!(expires, now + MEMORY_MAX_TTL);
    }
}
