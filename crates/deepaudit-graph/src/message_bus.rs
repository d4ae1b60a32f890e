//! Per-agent inter-agent message queues.
//!
//! Queue creation is lazy: the first `send` to an agent id creates its
//! queue. Queues are destroyed when the owning agent unregisters from the
//! [`crate::registry::AgentGraphRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Query,
    Instruction,
    Information,
    Result,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

/// Message queues keyed by recipient agent id, shared across clones.
#[derive(Clone, Default)]
pub struct MessageBus {
    queues: Arc<RwLock<HashMap<String, Vec<AgentMessage>>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_queue(&self, agent_id: &str) {
        self.queues.write().await.entry(agent_id.to_string()).or_default();
    }

    pub async fn delete_queue(&self, agent_id: &str) {
        self.queues.write().await.remove(agent_id);
    }

    pub async fn send(
        &self,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> AgentMessage {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let to_agent = to_agent.into();
        let message = AgentMessage {
            id: format!("msg_{id:08x}"),
            from_agent: from_agent.into(),
            to_agent: to_agent.clone(),
            content: content.into(),
            message_type,
            priority,
            timestamp: Utc::now(),
            read: false,
        };

        let mut queues = self.queues.write().await;
        queues.entry(to_agent).or_default().push(message.clone());
        message
    }

    /// Return an agent's messages in arrival order, optionally filtering
    /// to unread only and/or marking them read as a side effect.
    pub async fn receive(
        &self,
        agent_id: &str,
        unread_only: bool,
        mark_as_read: bool,
    ) -> Vec<AgentMessage> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(agent_id) else {
            return Vec::new();
        };

        let result: Vec<AgentMessage> = queue
            .iter()
            .filter(|m| !unread_only || !m.read)
            .cloned()
            .collect();

        if mark_as_read {
            for m in queue.iter_mut() {
                if !unread_only || !m.read {
                    m.read = true;
                }
            }
        }

        result
    }

    pub async fn has_unread(&self, agent_id: &str) -> bool {
        self.queues
            .read()
            .await
            .get(agent_id)
            .map(|q| q.iter().any(|m| !m.read))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_creates_queue_lazily() {
        let bus = MessageBus::new();
        bus.send("user", "agent-1", "hello", MessageType::Information, MessagePriority::Normal).await;
        assert!(bus.has_unread("agent-1").await);
    }

    #[tokio::test]
    async fn test_receive_preserves_arrival_order() {
        let bus = MessageBus::new();
        bus.send("user", "agent-1", "first", MessageType::Information, MessagePriority::Normal).await;
        bus.send("user", "agent-1", "second", MessageType::Information, MessagePriority::Normal).await;

        let messages = bus.receive("agent-1", false, false).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }

    #[tokio::test]
    async fn test_unread_only_then_mark_read_drains_queue() {
        let bus = MessageBus::new();
        bus.send("user", "agent-1", "hi", MessageType::Instruction, MessagePriority::High).await;

        let first = bus.receive("agent-1", true, true).await;
        assert_eq!(first.len(), 1);

        let second = bus.receive("agent-1", true, true).await;
        assert!(second.is_empty());
        assert!(!bus.has_unread("agent-1").await);
    }

    #[tokio::test]
    async fn test_delete_queue_drops_messages() {
        let bus = MessageBus::new();
        bus.send("user", "agent-1", "hi", MessageType::Information, MessagePriority::Normal).await;
        bus.delete_queue("agent-1").await;
        assert!(bus.receive("agent-1", false, false).await.is_empty());
    }
}
