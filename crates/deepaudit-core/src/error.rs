//! Error taxonomy and recovery policy (C1).
//!
//! Every error carries a recovery policy alongside its message: whether it's
//! recoverable, how a caller should recover, an optional `retry_after`, and a
//! severity. The policy is attached per-variant so callers never have to
//! guess how to react to a given kind.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::context::ExecutionContext;

/// How a recoverable error should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStrategy {
    Retry,
    RetryWithBackoff,
    Skip,
    Fallback,
    Abort,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured context attached to an error at the point it was raised.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub correlation_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
    pub iteration: Option<u32>,
    pub tool_name: Option<String>,
    pub additional: HashMap<String, String>,
}

impl ErrorContext {
    pub fn from_execution(ctx: &ExecutionContext) -> Self {
        Self {
            correlation_id: Some(ctx.correlation_id.clone()),
            agent_id: Some(ctx.current_agent_id.clone()),
            agent_name: None,
            task_id: Some(ctx.task_id.clone()),
            iteration: Some(ctx.iteration),
            tool_name: None,
            additional: HashMap::new(),
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }
}

/// Every kind this engine raises, grouped the way the recovery policy groups
/// them rather than by subsystem. `code()` is the stable string used in
/// serialized results and CLI exit reporting.
#[derive(Error, Debug)]
pub enum Error {
    // ---- LLM.* ----
    #[error("LLM rate limit exceeded: {message}")]
    LlmRateLimit {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("LLM call timed out: {0}")]
    LlmTimeout(String),
    #[error("LLM connection failed: {0}")]
    LlmConnection(String),
    #[error("LLM authentication failed: {0}")]
    LlmAuthentication(String),
    #[error("LLM content filter triggered: {0}")]
    LlmContentFilter(String),
    #[error("LLM context length exceeded: {0}")]
    LlmContextLength(String),
    #[error("LLM returned an invalid response: {0}")]
    LlmInvalidResponse(String),
    #[error("LLM quota exceeded: {0}")]
    LlmQuotaExceeded(String),

    // ---- Tool.* ----
    #[error("Tool execution failed: {tool} - {message}")]
    ToolExecution { tool: String, message: String },
    #[error("Tool timed out: {tool} after {elapsed_ms}ms")]
    ToolTimeout { tool: String, elapsed_ms: u64 },
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Tool input invalid: {tool} - {message}")]
    ToolInputInvalid { tool: String, message: String },
    #[error("Tool permission denied: {0}")]
    ToolPermission(String),
    #[error("Tool resource exhausted: {0}")]
    ToolResource(String),
    #[error("External tool failed: {tool} - {message}")]
    ExternalTool { tool: String, message: String },

    // ---- Agent.* ----
    #[error("Agent cancelled")]
    AgentCancelled,
    #[error("Agent timed out after {0:?}")]
    AgentTimeout(Duration),
    #[error("Agent reached its iteration limit ({0})")]
    AgentIterationLimit(u32),
    #[error("Agent initialization failed: {0}")]
    AgentInit(String),

    // ---- State.* ----
    #[error("State recovery failed: {0}")]
    StateRecovery(String),
    #[error("State persistence failed: {0}")]
    StatePersistence(String),
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ---- Comm.* ----
    #[error("Message delivery failed: {0}")]
    CommMessageDelivery(String),
    #[error("Agent not found: {0}")]
    CommAgentNotFound(String),

    // ---- Resource.* ----
    #[error("Circuit open for resource: {resource}")]
    ResourceCircuitOpen { resource: String },
    #[error("Rate limited on resource: {0}")]
    ResourceRateLimit(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ---- Validation.* ----
    #[error("Input validation failed: {0}")]
    ValidationInput(String),
    #[error("Path traversal rejected: {0}")]
    ValidationPathTraversal(String),
    #[error("File size exceeds cap: {path} ({size} bytes)")]
    ValidationFileSize { path: String, size: u64 },

    // ---- Ambient ----
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Stable machine-readable code, as carried in serialized results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::LlmRateLimit { .. } => "LLM.RateLimit",
            Error::LlmTimeout(_) => "LLM.Timeout",
            Error::LlmConnection(_) => "LLM.Connection",
            Error::LlmAuthentication(_) => "LLM.Auth",
            Error::LlmContentFilter(_) => "LLM.ContentFilter",
            Error::LlmContextLength(_) => "LLM.ContextLength",
            Error::LlmInvalidResponse(_) => "LLM.InvalidResponse",
            Error::LlmQuotaExceeded(_) => "LLM.QuotaExceeded",
            Error::ToolExecution { .. } => "Tool.Execution",
            Error::ToolTimeout { .. } => "Tool.Timeout",
            Error::ToolNotFound(_) => "Tool.NotFound",
            Error::ToolInputInvalid { .. } => "Tool.InputInvalid",
            Error::ToolPermission(_) => "Tool.Permission",
            Error::ToolResource(_) => "Tool.Resource",
            Error::ExternalTool { .. } => "Tool.ExternalTool",
            Error::AgentCancelled => "Agent.Cancelled",
            Error::AgentTimeout(_) => "Agent.Timeout",
            Error::AgentIterationLimit(_) => "Agent.IterationLimit",
            Error::AgentInit(_) => "Agent.Init",
            Error::StateRecovery(_) => "State.Recovery",
            Error::StatePersistence(_) => "State.Persistence",
            Error::InvalidStateTransition { .. } => "State.InvalidTransition",
            Error::CommMessageDelivery(_) => "Comm.MessageDelivery",
            Error::CommAgentNotFound(_) => "Comm.AgentNotFound",
            Error::ResourceCircuitOpen { .. } => "Resource.CircuitOpen",
            Error::ResourceRateLimit(_) => "Resource.RateLimit",
            Error::ResourceExhausted(_) => "Resource.Exhausted",
            Error::ValidationInput(_) => "Validation.Input",
            Error::ValidationPathTraversal(_) => "Validation.PathTraversal",
            Error::ValidationFileSize { .. } => "Validation.FileSize",
            Error::Serialization(_) => "Serialization",
            Error::Config(_) => "Config",
            Error::Unknown(_) => "Unknown",
        }
    }

    /// Authoritative recoverability mapping. See §4.1/§7.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            Error::LlmAuthentication(_)
                | Error::LlmQuotaExceeded(_)
                | Error::AgentIterationLimit(_)
                | Error::InvalidStateTransition { .. }
                | Error::ValidationPathTraversal(_)
                | Error::AgentCancelled
                | Error::Serialization(_)
                | Error::Config(_)
        )
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            Error::LlmRateLimit { .. } | Error::LlmTimeout(_) | Error::LlmConnection(_) => {
                RecoveryStrategy::RetryWithBackoff
            }
            Error::ToolTimeout { .. } | Error::ToolResource(_) => {
                RecoveryStrategy::RetryWithBackoff
            }
            Error::LlmContextLength(_) => RecoveryStrategy::Fallback,
            Error::ExternalTool { .. } => RecoveryStrategy::Fallback,
            Error::ToolNotFound(_)
            | Error::ToolInputInvalid { .. }
            | Error::LlmContentFilter(_)
            | Error::ValidationFileSize { .. } => RecoveryStrategy::Skip,
            Error::LlmAuthentication(_)
            | Error::LlmQuotaExceeded(_)
            | Error::AgentTimeout(_)
            | Error::AgentIterationLimit(_)
            | Error::InvalidStateTransition { .. }
            | Error::ValidationPathTraversal(_) => RecoveryStrategy::Abort,
            Error::AgentCancelled => RecoveryStrategy::Abort,
            Error::ResourceCircuitOpen { .. } | Error::ResourceRateLimit(_) => {
                RecoveryStrategy::RetryWithBackoff
            }
            _ => RecoveryStrategy::Manual,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::LlmAuthentication(_)
            | Error::ValidationPathTraversal(_)
            | Error::InvalidStateTransition { .. }
            | Error::StateRecovery(_) => Severity::Critical,
            Error::LlmQuotaExceeded(_)
            | Error::AgentTimeout(_)
            | Error::AgentIterationLimit(_)
            | Error::ResourceCircuitOpen { .. } => Severity::High,
            Error::LlmRateLimit { .. }
            | Error::LlmTimeout(_)
            | Error::LlmConnection(_)
            | Error::ToolExecution { .. }
            | Error::ExternalTool { .. } => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// `retry_after` override, if the error specifies one (e.g. a
    /// provider-reported `Retry-After` header).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::LlmRateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::LlmRateLimit {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limit_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::LlmRateLimit {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Bridges the older undifferentiated "stream/channel failed" call
    /// sites (provider SSE plumbing, inter-agent channels) onto the C1
    /// taxonomy until each call site is migrated to a more specific variant.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::CommMessageDelivery(message.into())
    }

    /// A non-2xx response from a provider's HTTP API, uncategorized by status.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::LlmInvalidResponse(format!("HTTP {status}: {}", message.into()))
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::LlmAuthentication(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::ValidationInput(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::LlmConnection(message.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        self.recoverable()
            && matches!(
                self.recovery_strategy(),
                RecoveryStrategy::Retry | RecoveryStrategy::RetryWithBackoff
            )
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::LlmAuthentication(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::rate_limit("x").code(), "LLM.RateLimit");
        assert_eq!(Error::LlmAuthentication("x".into()).code(), "LLM.Auth");
    }

    #[test]
    fn test_recoverability_mapping() {
        assert!(Error::rate_limit("too many").recoverable());
        assert!(!Error::LlmAuthentication("bad key".into()).recoverable());
        assert_eq!(
            Error::LlmContextLength("too big".into()).recovery_strategy(),
            RecoveryStrategy::Fallback
        );
    }

    #[test]
    fn test_retry_after_override() {
        let err = Error::rate_limit_after("slow down", Duration::from_secs(5));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(Error::LlmTimeout("x".into()).retry_after(), None);
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::LlmTimeout("x".into()).is_retryable());
        assert!(!Error::LlmAuthentication("x".into()).is_retryable());
        assert!(!Error::ToolNotFound("x".into()).is_retryable());
    }
}
