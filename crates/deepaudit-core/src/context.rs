//! Execution context (C5): ambient, task-scoped metadata carried through
//! every call that can log or emit an event.
//!
//! This is an explicit value passed down the call chain rather than
//! thread-local state — a thread-local would misattribute fields across
//! `tokio::spawn`ed tasks working on different agents concurrently.

use std::collections::HashMap;

/// Correlation/task/trace metadata threaded through a call chain.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub correlation_id: String,
    pub task_id: String,
    pub parent_agent_id: Option<String>,
    pub current_agent_id: String,
    pub trace_path: Vec<String>,
    pub iteration: u32,
    pub depth: u32,
    pub metadata: HashMap<String, String>,
}

impl ExecutionContext {
    /// Start a fresh root context for a new task.
    pub fn new_root(correlation_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            task_id: task_id.into(),
            parent_agent_id: None,
            current_agent_id: String::new(),
            trace_path: Vec::new(),
            iteration: 0,
            depth: 0,
            metadata: HashMap::new(),
        }
    }

    /// Derive a child context: same correlation/task id, trace path extended
    /// with this agent's name, depth incremented, parent recorded.
    pub fn child(&self, agent_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        let mut trace_path = self.trace_path.clone();
        trace_path.push(agent_name.into());
        Self {
            correlation_id: self.correlation_id.clone(),
            task_id: self.task_id.clone(),
            parent_agent_id: Some(self.current_agent_id.clone()),
            current_agent_id: agent_id,
            trace_path,
            iteration: 0,
            depth: self.depth + 1,
            metadata: self.metadata.clone(),
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_correlation_and_task() {
        let root = ExecutionContext::new_root("corr-1", "task-1");
        let child = root.child("agent-2", "recon");
        assert_eq!(child.correlation_id, "corr-1");
        assert_eq!(child.task_id, "task-1");
        assert_eq!(child.depth, 1);
        assert_eq!(child.trace_path, vec!["recon".to_string()]);
        assert_eq!(child.parent_agent_id, Some(String::new()));
    }

    #[test]
    fn test_grandchild_extends_trace_path() {
        let root = ExecutionContext::new_root("c", "t");
        let child = root.child("a1", "orchestrator");
        let grandchild = child.child("a2", "recon");
        assert_eq!(grandchild.depth, 2);
        assert_eq!(
            grandchild.trace_path,
            vec!["orchestrator".to_string(), "recon".to_string()]
        );
    }
}
