//! Per-service circuit breaking.
//!
//! One breaker per external service, keyed by the hostname of the
//! resolved request URL. State is process-wide: executions share the
//! default registry so a degraded service trips the circuit for
//! everyone, but embedders and tests can inject a private registry.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker tuning. Failures are counted within a sliding window; a
/// tripped breaker re-admits traffic after `cool_off` and closes again
/// after `half_open_successes` consecutive successes.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cool_off: Duration,
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cool_off: Duration::from_secs(10),
            half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without touching the service.
    Open,
    /// A limited probe is in flight to see whether the service
    /// recovered.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// Circuit breaker for a single service.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                window_start: Instant::now(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Whether a request may proceed. An `Open` breaker whose cool-off
    /// has elapsed transitions to `HalfOpen` and admits the request as
    /// a probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if inner.window_start.elapsed() >= self.config.window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                true
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cool_off {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.failures = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if inner.window_start.elapsed() >= self.config.window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                // First failure during the probe trips straight back.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

/// Process-wide map of service name to breaker.
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for a service, created on first use.
    pub fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone()))),
        )
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

lazy_static! {
    /// Shared registry used when the engine builder is not given a
    /// private one.
    pub static ref GLOBAL_CIRCUITS: Arc<CircuitRegistry> = Arc::new(CircuitRegistry::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cool_off: Duration::from_millis(100),
            half_open_successes: 2,
        }
    }

    #[test]
    fn test_breaker_starts_closed() {
        let breaker = CircuitBreaker::new(test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_breaker_trips_at_threshold() {
        let breaker = CircuitBreaker::new(test_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_cool_off_transitions_to_half_open() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(150));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_consecutive_successes() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_registry_shares_breakers_per_service() {
        let registry = CircuitRegistry::default();
        let a = registry.breaker_for("api.example");
        let b = registry.breaker_for("api.example");
        let other = registry.breaker_for("other.example");
        a.record_failure();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
