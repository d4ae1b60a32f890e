//! Typed event stream for the agent graph.
//!
//! Fan-out is broadcast-based: many subscribers, bounded buffer, producers
//! never block on a slow consumer (lagging subscribers simply miss old
//! events rather than stall the graph), the same tradeoff the CLI's
//! progress event bus makes for TUI consumption.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// The kind of step an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LlmStart,
    LlmThought,
    LlmAction,
    LlmObservation,
    LlmDecision,
    LlmComplete,
    ToolCall,
    ToolResult,
    Finding,
    Dispatch,
    DispatchComplete,
    Warning,
    Error,
    Info,
}

/// One record in the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEvent {
    pub event_type: EventType,
    pub message: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub iteration: Option<u32>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub correlation_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl GraphEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            agent_id: None,
            agent_name: None,
            iteration: None,
            tool_name: None,
            tool_input: None,
            tool_duration_ms: None,
            tokens_used: None,
            correlation_id: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, tool_input: Value) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_input = Some(tool_input);
        self
    }

    pub fn with_tool_duration_ms(mut self, duration_ms: u64) -> Self {
        self.tool_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Default capacity for the broadcast channel's ring buffer. Slow
/// subscribers drop the oldest events once they fall this far behind.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Graph-wide event emitter. Clone to share; clones see the same stream.
#[derive(Clone)]
pub struct GraphEventBus {
    tx: broadcast::Sender<GraphEvent>,
}

impl Default for GraphEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl GraphEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received
    /// it; zero is not an error, it just means nobody is currently
    /// listening.
    pub fn publish(&self, event: GraphEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = GraphEventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(GraphEvent::new(EventType::LlmStart, "starting").with_agent("a1", "recon"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.message, "starting");
        assert_eq!(event.agent_id.as_deref(), Some("a1"));
    }

    #[test]
    fn test_publish_with_no_subscribers_is_not_an_error() {
        let bus = GraphEventBus::new(4);
        assert_eq!(bus.publish(GraphEvent::new(EventType::Info, "noop")), 0);
    }
}
