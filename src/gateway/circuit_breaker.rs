// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Per-instance failure tracker. Stops sending traffic to an instance that
// keeps failing, then lets a single probe through once the recovery timeout
// has passed.
//
// States:
// - Closed: Normal operation, requests pass through
// - Open: Instance is failing, requests are rejected immediately
// - Half-Open: One probe request is allowed to test recovery
//
// All fields live behind one lock so every transition is a single
// read-modify-write.
//
// ============================================================================

use crate::config::CircuitBreakerConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Closed: Normal operation
    Closed,
    /// Open: Instance is failing, reject requests
    Open,
    /// Half-Open: Testing recovery
    HalfOpen,
}

/// Point-in-time view for the metrics endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// When the current half-open probe was let through
    probe_started: Option<Instant>,
}

/// Circuit breaker for one service instance
#[derive(Debug)]
pub struct CircuitBreaker {
    label: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::with_settings(label, config.failure_threshold, config.recovery_timeout())
    }

    pub fn with_settings(
        label: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                probe_started: None,
            }),
        }
    }

    /// Whether a request may be sent to this instance right now.
    ///
    /// While open, returns false until `recovery_timeout` has passed since the
    /// last failure; the first call after that moves to half-open and is the
    /// probe. Further calls are refused until the probe reports back, or until
    /// the probe has been outstanding for longer than `recovery_timeout`.
    pub async fn can_execute(&self) -> bool {
        let mut st = self.inner.lock().await;

        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(last_failure) = st.last_failure_time else {
                    return false;
                };
                if last_failure.elapsed() > self.recovery_timeout {
                    st.state = CircuitState::HalfOpen;
                    st.probe_started = Some(Instant::now());
                    tracing::info!(instance = %self.label, "Circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match st.probe_started {
                Some(started) if started.elapsed() <= self.recovery_timeout => false,
                _ => {
                    // The previous probe never reported back
                    st.probe_started = Some(Instant::now());
                    true
                }
            },
        }
    }

    /// Record a completed round trip
    pub async fn record_success(&self) {
        let mut st = self.inner.lock().await;

        if st.state != CircuitState::Closed {
            tracing::info!(
                instance = %self.label,
                previous_state = ?st.state,
                "Circuit breaker closed after successful request"
            );
        }
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.probe_started = None;
    }

    /// Record a transport failure or timeout
    pub async fn record_failure(&self) {
        let mut st = self.inner.lock().await;

        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure_time = Some(Instant::now());
        st.probe_started = None;

        if st.failure_count >= self.failure_threshold {
            if st.state != CircuitState::Open {
                tracing::warn!(
                    instance = %self.label,
                    failure_count = st.failure_count,
                    threshold = self.failure_threshold,
                    previous_state = ?st.state,
                    "Circuit breaker opened due to failures"
                );
            }
            st.state = CircuitState::Open;
        } else {
            tracing::debug!(
                instance = %self.label,
                failure_count = st.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker failure recorded"
            );
        }
    }

    /// Get current state (for metrics)
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Get failure count (for metrics)
    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.inner.lock().await;
        CircuitBreakerSnapshot {
            state: st.state,
            failure_count: st.failure_count,
        }
    }
}
