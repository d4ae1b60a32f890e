//! Circuit breaker (C3): Closed/Open/Half-Open per named resource.
//!
//! The Open -> Half-Open transition is lazy: there is no background timer.
//! A call arriving after `recovery_timeout` has elapsed since entering Open
//! is the thing that flips the breaker into Half-Open.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold: 3,
            recovery_timeout,
            half_open_max_calls: 3,
        }
    }

    /// `get_llm_circuit()` defaults.
    pub fn llm_default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }

    /// `get_tool_circuit(name)` defaults.
    pub fn tool_default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<Instant>,
}

impl CircuitStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

struct Inner {
    state: CircuitState,
    entered_state_at: Instant,
    stats: CircuitStats,
    half_open_calls: u32,
}

/// A single named circuit breaker. Cheaply cloneable; the lock guards the
/// small amount of mutable state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                entered_state_at: Instant::now(),
                stats: CircuitStats::default(),
                half_open_calls: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.lock().await.stats.clone()
    }

    /// Run `op` guarded by the breaker. Rejects with `ResourceCircuitOpen`
    /// without calling `op` if the circuit is Open and the recovery timeout
    /// has not yet elapsed. `excluded` errors are not counted as failures
    /// (but are still returned to the caller).
    pub async fn call<T, F, Fut>(
        &self,
        excluded: impl Fn(&Error) -> bool,
        op: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Open => {
                    if inner.entered_state_at.elapsed() >= self.config.recovery_timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.entered_state_at = Instant::now();
                        inner.half_open_calls = 0;
                    } else {
                        inner.stats.rejected_calls += 1;
                        return Err(Error::ResourceCircuitOpen {
                            resource: self.name.clone(),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_calls >= self.config.half_open_max_calls {
                        inner.stats.rejected_calls += 1;
                        return Err(Error::ResourceCircuitOpen {
                            resource: self.name.clone(),
                        });
                    }
                    inner.half_open_calls += 1;
                }
                CircuitState::Closed => {}
            }
            inner.stats.total_calls += 1;
        }

        let result = op().await;

        let mut inner = self.inner.lock().await;
        match &result {
            Ok(_) => {
                inner.stats.successful_calls += 1;
                inner.stats.consecutive_failures = 0;
                inner.stats.consecutive_successes += 1;
                match inner.state {
                    CircuitState::HalfOpen => {
                        if inner.stats.consecutive_successes >= self.config.success_threshold {
                            inner.state = CircuitState::Closed;
                            inner.entered_state_at = Instant::now();
                            inner.stats = CircuitStats::default();
                        }
                    }
                    _ => {}
                }
            }
            Err(err) => {
                if !excluded(err) {
                    inner.stats.failed_calls += 1;
                    inner.stats.consecutive_successes = 0;
                    inner.stats.consecutive_failures += 1;
                    inner.stats.last_failure_at = Some(Instant::now());

                    let should_open = match inner.state {
                        CircuitState::HalfOpen => true,
                        CircuitState::Closed => {
                            inner.stats.consecutive_failures >= self.config.failure_threshold
                        }
                        CircuitState::Open => false,
                    };
                    if should_open {
                        inner.state = CircuitState::Open;
                        inner.entered_state_at = Instant::now();
                    }
                }
            }
        }

        result
    }
}

/// Named registry of circuit breakers so call sites referencing the same
/// resource name share state.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    pub async fn get_llm_circuit(&self) -> CircuitBreaker {
        self.get_or_create("llm", CircuitBreakerConfig::llm_default()).await
    }

    pub async fn get_tool_circuit(&self, tool_name: &str) -> CircuitBreaker {
        self.get_or_create(
            &format!("tool:{tool_name}"),
            CircuitBreakerConfig::tool_default(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_exclusions(_: &Error) -> bool {
        false
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(3, Duration::from_millis(50)));
        for _ in 0..3 {
            let _ = breaker
                .call(no_exclusions, || async { Err::<(), _>(Error::tool("x", "fail")) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // B3: a 4th call within the recovery timeout is rejected.
        let result = breaker.call(no_exclusions, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::ResourceCircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(2, Duration::from_millis(20)));
        for _ in 0..2 {
            let _ = breaker
                .call(no_exclusions, || async { Err::<(), _>(Error::tool("x", "fail")) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = breaker.call(no_exclusions, || async { Ok(1) }).await;
        assert!(result.is_ok());
        // one success alone (threshold=3 default) stays Half-Open.
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let mut config = CircuitBreakerConfig::new(1, Duration::from_millis(10));
        config.success_threshold = 1;
        let breaker = CircuitBreaker::new("svc", config);
        let _ = breaker
            .call(no_exclusions, || async { Err::<(), _>(Error::tool("x", "fail")) })
            .await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = breaker
            .call(no_exclusions, || async { Err::<(), _>(Error::tool("x", "fail again")) })
            .await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_excluded_errors_not_counted() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::new(2, Duration::from_millis(10)));
        for _ in 0..5 {
            let _ = breaker
                .call(|_| true, || async { Err::<(), _>(Error::tool("x", "fail")) })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_shares_state_by_name() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_tool_circuit("semgrep").await;
        let b = registry.get_tool_circuit("semgrep").await;
        let _ = a
            .call(no_exclusions, || async { Err::<(), _>(Error::tool("x", "fail")) })
            .await;
        assert_eq!(b.stats().await.failed_calls, 1);
    }
}
