//! Retry engine (C2): configurable backoff with jitter, per-kind
//! retryability, cancellation-aware sleeps.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter_factor: f64,
    pub backoff: BackoffStrategy,
}

impl RetryConfig {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter_factor: 0.5,
            backoff: BackoffStrategy::Exponential,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// `LLM_RETRY_CONFIG`: 3 attempts, 1s base, 60s cap, exponential.
    pub fn llm_default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// `TOOL_RETRY_CONFIG`: 2 attempts, 2s base, 30s cap, exponential.
    pub fn tool_default() -> Self {
        Self::new(2, Duration::from_secs(2), Duration::from_secs(30))
    }

    /// `NO_RETRY_CONFIG`: a single attempt, no retry at all.
    pub fn none() -> Self {
        Self::new(1, Duration::from_secs(0), Duration::from_secs(0))
    }

    /// An error is retried if it is structurally recoverable via retry, or if
    /// its recovery strategy is retry-with-backoff. A non-recoverable error
    /// (e.g. auth) never retries regardless of kind.
    pub fn should_retry(&self, err: &Error) -> bool {
        use crate::error::RecoveryStrategy;
        err.recoverable()
            && matches!(
                err.recovery_strategy(),
                RecoveryStrategy::Retry | RecoveryStrategy::RetryWithBackoff
            )
    }

    /// Delay before `attempt` (1-indexed). `retry_after`, if the error
    /// carries one, overrides the computed backoff (still capped).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = if let Some(ra) = retry_after {
            ra.min(self.max_delay)
        } else {
            let computed = match self.backoff {
                BackoffStrategy::Constant => self.base_delay,
                BackoffStrategy::Linear => self.base_delay * attempt,
                BackoffStrategy::Exponential => {
                    let factor = self.exponential_base.powi(attempt as i32 - 1);
                    Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor)
                }
            };
            computed.min(self.max_delay)
        };

        let jitter_span = base.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let jittered = (base.as_secs_f64() + jitter).max(0.1);
        Duration::from_secs_f64(jittered)
    }
}

/// Result of a retried operation, distinguishing a successful outcome from
/// exhausted attempts so callers can inspect retry counts without unwrapping
/// an error.
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` up to `config.max_attempts` times. Non-retryable errors abort
/// immediately. `cancel` interrupts an in-progress sleep.
pub async fn retry_with_result<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<RetryOutcome<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::AgentCancelled);
        }
        match op().await {
            Ok(value) => return Ok(RetryOutcome { value, attempts: attempt }),
            Err(err) => {
                if attempt >= config.max_attempts || !config.should_retry(&err) {
                    return Err(err);
                }
                let delay = config.delay_for(attempt, err.retry_after());
                debug!(attempt, ?delay, code = err.code(), "retrying after failure");
                select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        warn!("retry sleep cancelled");
                        return Err(Error::AgentCancelled);
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// Stateful helper for manual retry loops that don't fit the `op`-closure
/// shape (e.g. the ReAct loop's empty-response and parse-failure counters).
pub struct RetryContext {
    pub limit: u32,
    pub count: u32,
}

impl RetryContext {
    pub fn new(limit: u32) -> Self {
        Self { limit, count: 0 }
    }

    pub fn should_continue(&self) -> bool {
        self.count < self.limit
    }

    pub fn record_failure(&mut self) {
        self.count += 1;
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let result = retry_with_result(&config, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::rate_limit("slow down"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let config = RetryConfig::llm_default();
        let cancel = CancellationToken::new();
        let result: Result<RetryOutcome<()>, Error> =
            retry_with_result(&config, &cancel, || async {
                Err(Error::LlmAuthentication("bad key".into()))
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new(5, Duration::from_secs(10), Duration::from_secs(15))
            .with_backoff(BackoffStrategy::Exponential);
        let delay = config.delay_for(5, None);
        // even with jitter, should not wildly exceed max_delay * (1+jitter_factor)
        assert!(delay.as_secs_f64() <= 15.0 * 1.5);
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let config = RetryConfig::llm_default();
        let delay = config.delay_for(1, Some(Duration::from_millis(100)));
        assert!(delay.as_secs_f64() < 1.0);
    }

    #[test]
    fn test_retry_context() {
        let mut ctx = RetryContext::new(3);
        assert!(ctx.should_continue());
        ctx.record_failure();
        ctx.record_failure();
        ctx.record_failure();
        assert!(!ctx.should_continue());
        ctx.record_success();
        assert!(ctx.should_continue());
    }
}
