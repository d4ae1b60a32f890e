//! Thread-safe registry of live and finished agents, with the parent/child
//! edges that make up the dynamic agent tree.
//!
//! The registry holds two layers per agent: a denormalized `AgentNode`
//! snapshot (cheap to clone and serialize for the CLI's `graph` command)
//! and, while the agent is alive, a handle used to request cancellation.
//! `update_status` keeps the snapshot current; nothing ever serializes the
//! live handle itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use deepaudit_core::AgentState;

/// Status values mirrored onto a node. Kept as a string in the node
/// itself (for forward-compatible serialization) but constructed from
/// this enum everywhere inside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Created,
    Running,
    Waiting,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl NodeStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Stopped)
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            NodeStatus::Created => "*",
            NodeStatus::Running => ">",
            NodeStatus::Waiting => "~",
            NodeStatus::Stopping => "!",
            NodeStatus::Completed => "+",
            NodeStatus::Failed => "x",
            NodeStatus::Stopped => "#",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Created => "created",
            NodeStatus::Running => "running",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// An immutable-enough snapshot of one agent, safe to serialize without
/// holding any lock on the live agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: String,
    pub name: String,
    pub role: String,
    pub task: String,
    pub status: NodeStatus,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub knowledge_modules: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub created_at: DateTime<Utc>,
}

/// Handle the registry keeps for a live agent so it can request it stop.
/// Not serialized; dropped once the agent finishes and `cleanup_finished`
/// runs.
struct LiveHandle {
    state: Arc<RwLock<AgentState>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, AgentNode>,
    edges: Vec<AgentEdge>,
    live: HashMap<String, LiveHandle>,
    root_agent_id: Option<String>,
}

/// Full tree snapshot returned by [`AgentGraphRegistry::tree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTree {
    pub nodes: HashMap<String, AgentNode>,
    pub edges: Vec<AgentEdge>,
    pub root_agent_id: Option<String>,
}

/// Counts of agents by status, as returned by [`AgentGraphRegistry::statistics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatistics {
    pub total: usize,
    pub running: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

/// Thread-safe registry mapping agent id to node, live handle, and edges.
///
/// Cloning shares the same underlying tree (cheap `Arc` clone), matching
/// the shared-ownership style `TaskManager` uses for its task map.
#[derive(Clone, Default)]
pub struct AgentGraphRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl AgentGraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent. If `parent_id` is set, adds a delegation edge
    /// and appends to the parent's children. The first rootless agent
    /// registered becomes the tree root.
    pub async fn register(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        task: impl Into<String>,
        parent_id: Option<String>,
        knowledge_modules: Vec<String>,
        state: Arc<RwLock<AgentState>>,
        cancel: CancellationToken,
    ) -> AgentNode {
        let id = id.into();
        let node = AgentNode {
            id: id.clone(),
            name: name.into(),
            role: role.into(),
            task: task.into(),
            status: NodeStatus::Running,
            parent_id: parent_id.clone(),
            children: Vec::new(),
            knowledge_modules,
            created_at: Utc::now(),
            finished_at: None,
        };

        let mut inner = self.inner.write().await;
        inner.nodes.insert(id.clone(), node.clone());
        inner.live.insert(id.clone(), LiveHandle { state, cancel });

        if let Some(parent) = &parent_id {
            inner.edges.push(AgentEdge {
                from: parent.clone(),
                to: id.clone(),
                edge_type: "delegation".to_string(),
                created_at: Utc::now(),
            });
            if let Some(parent_node) = inner.nodes.get_mut(parent) {
                parent_node.children.push(id.clone());
            }
        } else if inner.root_agent_id.is_none() {
            inner.root_agent_id = Some(id.clone());
        }

        node
    }

    pub async fn unregister(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.nodes.remove(id);
        inner.live.remove(id);
        inner.edges.retain(|e| e.from != id && e.to != id);
    }

    /// Update an agent's status snapshot, recording `finished_at` when the
    /// new status is terminal.
    pub async fn update_status(&self, id: &str, status: NodeStatus) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(id) {
            node.status = status;
            if status.is_finished() {
                node.finished_at = Some(Utc::now());
            }
        }
    }

    pub async fn status(&self, id: &str) -> Option<NodeStatus> {
        self.inner.read().await.nodes.get(id).map(|n| n.status)
    }

    pub async fn node(&self, id: &str) -> Option<AgentNode> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    pub async fn state(&self, id: &str) -> Option<Arc<RwLock<AgentState>>> {
        self.inner.read().await.live.get(id).map(|h| h.state.clone())
    }

    pub async fn root_agent_id(&self) -> Option<String> {
        self.inner.read().await.root_agent_id.clone()
    }

    pub async fn children(&self, id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .nodes
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub async fn parent(&self, id: &str) -> Option<String> {
        self.inner.read().await.nodes.get(id).and_then(|n| n.parent_id.clone())
    }

    pub async fn tree(&self) -> AgentTree {
        let inner = self.inner.read().await;
        AgentTree {
            nodes: inner.nodes.clone(),
            edges: inner.edges.clone(),
            root_agent_id: inner.root_agent_id.clone(),
        }
    }

    pub async fn statistics(&self) -> AgentStatistics {
        let inner = self.inner.read().await;
        let mut stats = AgentStatistics {
            total: inner.nodes.len(),
            ..Default::default()
        };
        for node in inner.nodes.values() {
            match node.status {
                NodeStatus::Running => stats.running += 1,
                NodeStatus::Waiting => stats.waiting += 1,
                NodeStatus::Completed => stats.completed += 1,
                NodeStatus::Failed => stats.failed += 1,
                NodeStatus::Stopped => stats.stopped += 1,
                NodeStatus::Created | NodeStatus::Stopping => {}
            }
        }
        stats
    }

    /// Request that an agent stop: marks it `stopping`, fires its
    /// cancellation token, and asks its state to record the stop request.
    /// Returns `false` if the agent is unknown.
    pub async fn stop_agent(&self, id: &str) -> bool {
        let (cancel, state) = {
            let inner = self.inner.read().await;
            let Some(node) = inner.nodes.get(id) else {
                return false;
            };
            if node.status.is_finished() {
                return true;
            }
            match inner.live.get(id) {
                Some(handle) => (handle.cancel.clone(), handle.state.clone()),
                None => return false,
            }
        };

        state.write().await.request_stop();
        cancel.cancel();
        self.update_status(id, NodeStatus::Stopping).await;
        true
    }

    /// Propagate a stop request to every descendant of `id`, then to `id`
    /// itself. Used when a parent agent is cancelled so the whole subtree
    /// winds down rather than leaving orphaned children running.
    pub async fn stop_subtree(&self, id: &str) {
        let children = self.children(id).await;
        for child in children {
            Box::pin(self.stop_subtree(&child)).await;
        }
        self.stop_agent(id).await;
    }

    /// Stop every agent in the tree, optionally excluding the root.
    pub async fn stop_all(&self, exclude_root: bool) -> (Vec<String>, Vec<String>) {
        let tree = self.tree().await;
        let root = tree.root_agent_id.clone();
        let mut stopped = Vec::new();
        let mut failed = Vec::new();
        for (id, node) in tree.nodes {
            if exclude_root && Some(&id) == root.as_ref() {
                continue;
            }
            if node.status.is_finished() {
                continue;
            }
            if self.stop_agent(&id).await {
                stopped.push(id);
            } else {
                failed.push(id);
            }
        }
        (stopped, failed)
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }

    /// Drop live handles for finished agents while keeping their node
    /// snapshots for reporting. Returns the number cleaned up.
    pub async fn cleanup_finished(&self) -> usize {
        let mut inner = self.inner.write().await;
        let finished: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.status.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            inner.live.remove(id);
        }
        finished.len()
    }

    /// A human-readable indented tree, rooted at `from` or the tree root.
    pub async fn tree_view(&self, from: Option<&str>) -> String {
        let tree = self.tree().await;
        let root_id = from.map(str::to_string).or_else(|| tree.root_agent_id.clone());
        let Some(root_id) = root_id else {
            return "No agents in the tree".to_string();
        };
        if !tree.nodes.contains_key(&root_id) {
            return "No agents in the tree".to_string();
        }

        let mut lines = vec!["=== AGENT TREE ===".to_string()];
        let mut stack = vec![(root_id, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = tree.nodes.get(&id) else { continue };
            let indent = "  ".repeat(depth);
            lines.push(format!("{indent}[{}] {} ({id})", node.status.glyph(), node.name));
            lines.push(format!("{indent}   task: {}", truncate(&node.task, 50)));
            lines.push(format!("{indent}   status: {}", node.status));
            if !node.knowledge_modules.is_empty() {
                lines.push(format!("{indent}   modules: {}", node.knowledge_modules.join(", ")));
            }
            for child in node.children.iter().rev() {
                stack.push((child.clone(), depth + 1));
            }
        }
        lines.join("\n")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_handle() -> Arc<RwLock<AgentState>> {
        Arc::new(RwLock::new(AgentState::new("root", "orchestrator", "audit this repo")))
    }

    #[tokio::test]
    async fn test_register_sets_root_for_first_rootless_agent() {
        let reg = AgentGraphRegistry::new();
        reg.register(
            "root",
            "root",
            "orchestrator",
            "audit",
            None,
            vec![],
            state_handle(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(reg.root_agent_id().await, Some("root".to_string()));
    }

    #[tokio::test]
    async fn test_register_child_adds_edge_and_parent_children() {
        let reg = AgentGraphRegistry::new();
        reg.register("root", "root", "orchestrator", "audit", None, vec![], state_handle(), CancellationToken::new()).await;
        reg.register(
            "child",
            "recon",
            "recon",
            "map the repo",
            Some("root".to_string()),
            vec![],
            state_handle(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(reg.children("root").await, vec!["child".to_string()]);
        assert_eq!(reg.parent("child").await, Some("root".to_string()));
        let tree = reg.tree().await;
        assert_eq!(tree.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_agent_marks_stopping_and_cancels_token() {
        let reg = AgentGraphRegistry::new();
        let cancel = CancellationToken::new();
        reg.register("a", "a", "recon", "t", None, vec![], state_handle(), cancel.clone()).await;

        assert!(reg.stop_agent("a").await);
        assert_eq!(reg.status("a").await, Some(NodeStatus::Stopping));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_agent_on_finished_agent_is_a_noop_success() {
        let reg = AgentGraphRegistry::new();
        reg.register("a", "a", "recon", "t", None, vec![], state_handle(), CancellationToken::new()).await;
        reg.update_status("a", NodeStatus::Completed).await;

        assert!(reg.stop_agent("a").await);
        assert_eq!(reg.status("a").await, Some(NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_stop_subtree_propagates_to_descendants() {
        let reg = AgentGraphRegistry::new();
        let root_cancel = CancellationToken::new();
        let child_cancel = CancellationToken::new();
        reg.register("root", "root", "orchestrator", "t", None, vec![], state_handle(), root_cancel.clone()).await;
        reg.register("child", "recon", "recon", "t", Some("root".to_string()), vec![], state_handle(), child_cancel.clone()).await;

        reg.stop_subtree("root").await;

        assert!(root_cancel.is_cancelled());
        assert!(child_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cleanup_finished_drops_live_handle_keeps_node() {
        let reg = AgentGraphRegistry::new();
        reg.register("a", "a", "recon", "t", None, vec![], state_handle(), CancellationToken::new()).await;
        reg.update_status("a", NodeStatus::Failed).await;

        let cleaned = reg.cleanup_finished().await;
        assert_eq!(cleaned, 1);
        assert!(reg.node("a").await.is_some());
        assert!(reg.state("a").await.is_none());
    }

    #[tokio::test]
    async fn test_statistics_counts_by_status() {
        let reg = AgentGraphRegistry::new();
        reg.register("a", "a", "recon", "t", None, vec![], state_handle(), CancellationToken::new()).await;
        reg.register("b", "b", "recon", "t", None, vec![], state_handle(), CancellationToken::new()).await;
        reg.update_status("b", NodeStatus::Completed).await;

        let stats = reg.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
    }
}
