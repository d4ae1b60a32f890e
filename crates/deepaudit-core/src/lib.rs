//! deepaudit-core: foundational types and traits shared by every agent role
//! and tool in the auditor engine.

pub mod blocking;
pub mod chunker;
pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod finding;
pub mod llm_client;
pub mod message;
pub mod observation;
pub mod parser;
pub mod provider;
pub mod rate_limiter;
pub mod retry;
pub mod state;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitStats, CircuitState};
pub use context::ExecutionContext;
pub use error::{Error, ErrorContext, RecoveryStrategy, Severity};
pub use finding::{
    fingerprints_match, merge_findings, normalize_and_dedup, normalize_finding, DiscoveredBy,
    Finding,
};
pub use llm_client::{reduce_conversation, FallbackConfig, LlmClient};
pub use message::{Content, ContentPart, Message, Role, StreamChunk, ToolCall, ToolResult, Usage, strip_thinking_tags};
pub use parser::{parse_structured_output, ParseError};
pub use provider::{
    CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult,
};
pub use rate_limiter::{RateLimiterRegistry, SlidingWindowRateLimiter, TokenBucketRateLimiter};
pub use retry::{retry_with_result, BackoffStrategy, RetryConfig, RetryContext, RetryOutcome};
pub use state::{AgentState, AgentStatus, Checkpoint, CheckpointStore};
pub use tool::{PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters, ToolRegistry, execute_tool_dispatch};
pub use chunker::{ChunkProcessor, ChunkerConfig};
pub use blocking::run_blocking;
pub use observation::{ContextCompactor, ObservationalMemory, ObservationConfig, find_safe_split_point};

pub type Result<T> = std::result::Result<T, Error>;
