//! High-level control and introspection atop the agent graph registry.
//!
//! This is the surface the CLI control plane and the orchestrator's
//! graph-inspection tool both call through: stopping agents, routing user
//! messages, and collecting findings across the whole tree.

use std::collections::HashMap;

use deepaudit_core::Finding;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message_bus::{MessageBus, MessagePriority, MessageType};
use crate::registry::{AgentGraphRegistry, AgentStatistics, AgentTree, NodeStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResult {
    pub success: bool,
    pub agent_id: String,
    pub already_finished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAllResult {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgentsSummary {
    pub running: Vec<String>,
    pub waiting: Vec<String>,
    pub stopping: Vec<String>,
    pub has_active_agents: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub total: usize,
    pub by_severity: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

/// Control-plane operations layered over [`AgentGraphRegistry`] and
/// [`MessageBus`].
#[derive(Clone)]
pub struct GraphController {
    registry: AgentGraphRegistry,
    messages: MessageBus,
}

impl GraphController {
    pub fn new(registry: AgentGraphRegistry, messages: MessageBus) -> Self {
        Self { registry, messages }
    }

    pub async fn stop_agent(&self, agent_id: &str) -> StopResult {
        let already_finished = self
            .registry
            .status(agent_id)
            .await
            .map(|s| s.is_finished())
            .unwrap_or(false);
        let success = self.registry.stop_agent(agent_id).await;
        StopResult {
            success,
            agent_id: agent_id.to_string(),
            already_finished,
        }
    }

    pub async fn stop_all_agents(&self, exclude_root: bool) -> StopAllResult {
        let (stopped, failed) = self.registry.stop_all(exclude_root).await;
        StopAllResult { stopped, failed }
    }

    pub async fn send_user_message(&self, target_agent_id: &str, message: impl Into<String>) -> bool {
        if self.registry.node(target_agent_id).await.is_none() {
            return false;
        }
        self.messages
            .send("user", target_agent_id, message, MessageType::Instruction, MessagePriority::High)
            .await;
        true
    }

    pub async fn send_agent_message(
        &self,
        from_agent: &str,
        target_agent_id: &str,
        message: impl Into<String>,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> bool {
        if self.registry.node(target_agent_id).await.is_none() {
            return false;
        }
        self.messages.send(from_agent, target_agent_id, message, message_type, priority).await;
        true
    }

    pub async fn agent_graph(&self) -> (AgentTree, AgentStatistics, String) {
        let tree = self.registry.tree().await;
        let stats = self.registry.statistics().await;
        let view = self.registry.tree_view(None).await;
        (tree, stats, view)
    }

    pub async fn check_active_agents(&self, exclude: Option<&str>) -> ActiveAgentsSummary {
        let tree = self.registry.tree().await;
        let mut running = Vec::new();
        let mut waiting = Vec::new();
        let mut stopping = Vec::new();

        for (id, node) in tree.nodes {
            if exclude == Some(id.as_str()) {
                continue;
            }
            match node.status {
                NodeStatus::Running => running.push(id),
                NodeStatus::Waiting => waiting.push(id),
                NodeStatus::Stopping => stopping.push(id),
                _ => {}
            }
        }

        let has_active_agents = !running.is_empty() || !stopping.is_empty();
        ActiveAgentsSummary {
            running,
            waiting,
            stopping,
            has_active_agents,
        }
    }

    /// Flatten findings recorded on every node's stored result, annotating
    /// each with which agent discovered it. Nodes without a stored result
    /// (still running, or the result carried no findings) contribute
    /// nothing.
    pub async fn collect_all_findings(&self, results: &HashMap<String, Value>) -> Vec<Finding> {
        let tree = self.registry.tree().await;
        let mut all = Vec::new();

        for (id, node) in &tree.nodes {
            let Some(result) = results.get(id) else { continue };
            let Some(raw_findings) = result.get("findings").and_then(|v| v.as_array()) else {
                continue;
            };
            for raw in raw_findings {
                let mut finding = deepaudit_core::normalize_finding(raw);
                finding.discovered_by = Some(deepaudit_core::DiscoveredBy {
                    agent_id: id.clone(),
                    agent_name: node.name.clone(),
                });
                all.push(finding);
            }
        }

        all
    }

    pub fn findings_summary(&self, findings: &[Finding]) -> FindingsSummary {
        let mut summary = FindingsSummary {
            total: findings.len(),
            ..Default::default()
        };
        for f in findings {
            *summary.by_severity.entry(f.severity.clone()).or_insert(0) += 1;
            *summary.by_type.entry(f.vulnerability_type.clone()).or_insert(0) += 1;
        }
        summary
    }

    pub async fn cleanup(&self) -> usize {
        self.registry.cleanup_finished().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentGraphRegistry;
    use deepaudit_core::AgentState;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    fn controller() -> GraphController {
        GraphController::new(AgentGraphRegistry::new(), MessageBus::new())
    }

    #[tokio::test]
    async fn test_send_user_message_fails_for_unknown_agent() {
        let ctl = controller();
        assert!(!ctl.send_user_message("ghost", "hi").await);
    }

    #[tokio::test]
    async fn test_collect_all_findings_annotates_discovered_by() {
        let ctl = controller();
        ctl.registry
            .register(
                "a1",
                "recon",
                "recon",
                "map repo",
                None,
                vec![],
                Arc::new(RwLock::new(AgentState::new("recon", "recon", "map repo"))),
                CancellationToken::new(),
            )
            .await;

        let mut results = HashMap::new();
        results.insert(
            "a1".to_string(),
            json!({"findings": [{"file_path": "a.py", "type": "xss", "description": "d"}]}),
        );

        let findings = ctl.collect_all_findings(&results).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].discovered_by.as_ref().unwrap().agent_id, "a1");
    }

    #[tokio::test]
    async fn test_check_active_agents_excludes_given_id() {
        let ctl = controller();
        ctl.registry
            .register(
                "a1",
                "recon",
                "recon",
                "t",
                None,
                vec![],
                Arc::new(RwLock::new(AgentState::new("recon", "recon", "t"))),
                CancellationToken::new(),
            )
            .await;

        let summary = ctl.check_active_agents(Some("a1")).await;
        assert!(summary.running.is_empty());
        assert!(!summary.has_active_agents);
    }

    #[test]
    fn test_findings_summary_counts_by_severity_and_type() {
        let ctl = controller();
        let findings = vec![
            deepaudit_core::normalize_finding(&json!({"severity": "high", "type": "xss"})),
            deepaudit_core::normalize_finding(&json!({"severity": "high", "type": "sqli", "description": "sql injection here"})),
        ];
        let summary = ctl.findings_summary(&findings);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_severity.get("high"), Some(&2));
    }
}
