//! Rate limiter (C4): token-bucket and sliding-window variants, named
//! registries for LLM / per-tool / file-read limiters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Replenishes by `elapsed * rate` up to `burst` on every check.
#[derive(Clone)]
pub struct TokenBucketRateLimiter {
    name: String,
    rate: f64,
    burst: f64,
    inner: Arc<Mutex<BucketInner>>,
}

impl TokenBucketRateLimiter {
    pub fn new(name: impl Into<String>, rate: f64, burst: f64) -> Self {
        Self {
            name: name.into(),
            rate,
            burst,
            inner: Arc::new(Mutex::new(BucketInner {
                tokens: burst,
                last_refill: Instant::now(),
            })),
        }
    }

    fn replenish(inner: &mut BucketInner, rate: f64, burst: f64) {
        let elapsed = inner.last_refill.elapsed().as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * rate).min(burst);
        inner.last_refill = Instant::now();
    }

    pub async fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        Self::replenish(&mut inner, self.rate, self.burst);
        inner.tokens
    }

    pub async fn try_acquire(&self, tokens: f64) -> bool {
        let mut inner = self.inner.lock().await;
        Self::replenish(&mut inner, self.rate, self.burst);
        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Blocks until `tokens` are available, `timeout` elapses, or `cancel`
    /// fires.
    pub async fn acquire(
        &self,
        tokens: f64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                Self::replenish(&mut inner, self.rate, self.burst);
                if inner.tokens >= tokens {
                    inner.tokens -= tokens;
                    return Ok(());
                }
                let needed = tokens - inner.tokens;
                Duration::from_secs_f64((needed / self.rate).max(0.0))
            };

            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(Error::ResourceRateLimit(format!(
                        "timed out waiting for rate limiter '{}'",
                        self.name
                    )));
                }
            }
            select! {
                _ = sleep(wait.min(Duration::from_millis(50))) => {}
                _ = cancel.cancelled() => return Err(Error::AgentCancelled),
            }
        }
    }
}

struct WindowInner {
    timestamps: Vec<Instant>,
}

/// Admits up to `max_requests` within a trailing `window`.
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    name: String,
    max_requests: usize,
    window: Duration,
    inner: Arc<Mutex<WindowInner>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(name: impl Into<String>, max_requests: usize, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            inner: Arc::new(Mutex::new(WindowInner { timestamps: Vec::new() })),
        }
    }

    fn evict_expired(inner: &mut WindowInner, window: Duration) {
        let now = Instant::now();
        inner.timestamps.retain(|t| now.duration_since(*t) < window);
    }

    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                Self::evict_expired(&mut inner, self.window);
                if inner.timestamps.len() < self.max_requests {
                    inner.timestamps.push(Instant::now());
                    return Ok(());
                }
                let oldest = inner.timestamps.first().copied().unwrap();
                let until_expiry = self.window.saturating_sub(oldest.elapsed());
                until_expiry + Duration::from_millis(10)
            };

            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(Error::ResourceRateLimit(format!(
                        "timed out waiting for rate limiter '{}'",
                        self.name
                    )));
                }
            }
            select! {
                _ = sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Error::AgentCancelled),
            }
        }
    }
}

enum Limiter {
    TokenBucket(TokenBucketRateLimiter),
    SlidingWindow(SlidingWindowRateLimiter),
}

/// Lazily creates named limiters on first reference, matching
/// `get_rate_limiter(name, rate, burst)`.
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, Limiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_token_bucket(&self, name: &str, rate: f64, burst: f64) -> TokenBucketRateLimiter {
        let mut limiters = self.limiters.lock().await;
        match limiters.entry(name.to_string()).or_insert_with(|| {
            Limiter::TokenBucket(TokenBucketRateLimiter::new(name, rate, burst))
        }) {
            Limiter::TokenBucket(l) => l.clone(),
            Limiter::SlidingWindow(_) => unreachable!("limiter name reused with different kind"),
        }
    }

    /// LLM limiter: ~1/s, burst 5.
    pub async fn llm(&self) -> TokenBucketRateLimiter {
        self.get_token_bucket("llm", 1.0, 5.0).await
    }

    /// Per-external-tool limiter: 0.2/s, burst 3.
    pub async fn external_tool(&self, tool_name: &str) -> TokenBucketRateLimiter {
        self.get_token_bucket(&format!("tool:{tool_name}"), 0.2, 3.0).await
    }

    /// File-read limiter: 10/s, burst 20.
    pub async fn file_read(&self) -> TokenBucketRateLimiter {
        self.get_token_bucket("file_read", 10.0, 20.0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_bucket_burst_then_wait() {
        // B4: rate 1/s, burst 5, six immediate acquires: first 5 instant, 6th waits ~1s.
        let limiter = TokenBucketRateLimiter::new("t", 1.0, 5.0);
        for _ in 0..5 {
            assert!(limiter.try_acquire(1.0).await);
        }
        assert!(!limiter.try_acquire(1.0).await);

        let start = Instant::now();
        let cancel = CancellationToken::new();
        limiter.acquire(1.0, Some(Duration::from_secs(2)), &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_token_bucket_replenishes_over_time() {
        let limiter = TokenBucketRateLimiter::new("t", 10.0, 2.0);
        assert!(limiter.try_acquire(2.0).await);
        assert!(!limiter.try_acquire(1.0).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.available_tokens().await >= 1.0);
    }

    #[tokio::test]
    async fn test_sliding_window_admits_up_to_max() {
        let limiter = SlidingWindowRateLimiter::new("w", 2, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        limiter.acquire(None, &cancel).await.unwrap();
        limiter.acquire(None, &cancel).await.unwrap();
        let result = limiter.acquire(Some(Duration::from_millis(10)), &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_registry_reuses_named_limiter() {
        let registry = RateLimiterRegistry::new();
        let a = registry.llm().await;
        let b = registry.llm().await;
        a.try_acquire(5.0).await;
        assert!(b.available_tokens().await < 1.0);
    }
}
