//! LLM client shim (C8): wraps a `Provider` with rate limiting, circuit
//! breaking, retry, and a context-length fallback, in that order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::Error;
use crate::observation::find_safe_split_point;
use crate::provider::{CompletionRequest, CompletionResponse, Provider};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::retry::{retry_with_result, RetryConfig};

/// Fraction of the conversation (by message count, system+last-user
/// excluded) to drop when the provider reports a context-length error.
/// Configurable, capped at 0.5 per §4.8.
#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    pub drop_fraction: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { drop_fraction: 0.5 }
    }
}

/// The wrapped client every agent role calls through. Construction pulls a
/// named rate limiter and circuit breaker from the shared registries so all
/// callers against the same provider share back-pressure state.
pub struct LlmClient {
    provider: Arc<dyn Provider>,
    rate_limiter: TokenBucketRateLimiter,
    circuit: CircuitBreaker,
    retry: RetryConfig,
    fallback: FallbackConfig,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn Provider>, rate_limiter: TokenBucketRateLimiter) -> Self {
        Self {
            provider,
            rate_limiter,
            circuit: CircuitBreaker::new("llm", CircuitBreakerConfig::llm_default()),
            retry: RetryConfig::llm_default(),
            fallback: FallbackConfig::default(),
        }
    }

    pub fn with_circuit(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// `chat_completion_raw`: rate limiter -> circuit breaker -> retry,
    /// with a context-length fallback that reduces the conversation and
    /// retries once more outside the normal retry budget.
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, Error> {
        match self.complete_inner(request.clone(), cancel).await {
            Err(Error::LlmContextLength(msg)) => {
                warn!(error = %msg, "context length exceeded, reducing conversation");
                request.messages = reduce_conversation(&request.messages, self.fallback.drop_fraction);
                self.complete_inner(request, cancel).await
            }
            other => other,
        }
    }

    async fn complete_inner(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, Error> {
        self.rate_limiter
            .acquire(1.0, Some(std::time::Duration::from_secs(30)), cancel)
            .await?;

        let provider = Arc::clone(&self.provider);
        let outcome = retry_with_result(&self.retry, cancel, || {
            let provider = Arc::clone(&provider);
            let request = request.clone();
            let circuit = self.circuit.clone();
            async move {
                circuit
                    .call(
                        |err| matches!(err, Error::LlmContentFilter(_) | Error::LlmContextLength(_)),
                        || async { provider.complete(request).await },
                    )
                    .await
            }
        })
        .await?;

        Ok(outcome.value)
    }
}

/// Drop the middle of the conversation, preserving the system prompt and
/// the most recent messages (including the last user turn), never splitting
/// a tool-call/tool-result pair (L5).
pub fn reduce_conversation(messages: &[crate::message::Message], drop_fraction: f64) -> Vec<crate::message::Message> {
    use crate::message::Role;

    if messages.is_empty() {
        return Vec::new();
    }

    let drop_fraction = drop_fraction.min(0.5);
    let system_end = messages
        .iter()
        .position(|m| !matches!(m.role, Role::System))
        .unwrap_or(messages.len());

    let body_len = messages.len() - system_end;
    if body_len == 0 {
        return messages.to_vec();
    }

    let target_keep = ((body_len as f64) * (1.0 - drop_fraction)).ceil() as usize;
    let naive_cut = messages.len().saturating_sub(target_keep.max(1));
    let cut = find_safe_split_point(messages, naive_cut.max(system_end));

    let mut result = messages[..system_end].to_vec();
    result.extend_from_slice(&messages[cut..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_reduce_conversation_keeps_system_and_last_user() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..20 {
            messages.push(Message::user(format!("u{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }
        messages.push(Message::user("final question"));

        let reduced = reduce_conversation(&messages, 0.5);
        assert!(matches!(reduced[0].role, crate::message::Role::System));
        assert_eq!(
            reduced.last().unwrap().content.as_text(),
            Some("final question")
        );
        assert!(reduced.len() < messages.len());
    }

    #[test]
    fn test_drop_fraction_capped_at_half() {
        let mut messages = vec![Message::system("sys")];
        for i in 0..10 {
            messages.push(Message::user(format!("u{i}")));
        }
        let reduced = reduce_conversation(&messages, 0.9);
        // even asking to drop 90%, at least half the body is kept.
        assert!(reduced.len() >= messages.len() / 2);
    }
}
