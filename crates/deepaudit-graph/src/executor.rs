//! Parallel execution of a batch of child-agent tasks with dependency
//! ordering and a concurrency cap.
//!
//! Grounded in the same spawn/watch/join-handle shape `TaskManager` uses
//! for generic async tasks, specialized here to a fixed-size batch with a
//! dependency graph instead of an open-ended task registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use deepaudit_core::Error;

/// Default per-task timeout: an agent that hangs for ten minutes is
/// almost certainly stuck, not slow.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of children allowed to run concurrently.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// One unit of work to run through the executor.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub agent_id: String,
    pub role: String,
    pub task: String,
    pub context: Value,
    pub priority: i32,
    pub dependencies: Vec<String>,
}

/// Outcome of a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub agent_id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub tokens_used: u64,
    pub tool_calls: u64,
    pub findings_count: usize,
    pub duration_ms: u64,
}

/// Aggregated result of running a full batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub outcomes: Vec<TaskOutcome>,
    pub total_tokens: u64,
    pub total_tool_calls: u64,
    pub total_findings: usize,
    pub wallclock_ms: u64,
}

/// What a task runner must produce for one [`ExecutionTask`].
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ExecutionTask, cancel: &CancellationToken) -> Result<Value, Error>;
}

/// Runs a batch of [`ExecutionTask`]s respecting their `dependencies`,
/// bounded by a concurrency semaphore, each under its own timeout.
pub struct DynamicExecutor {
    runner: Arc<dyn TaskRunner>,
    concurrency: usize,
    task_timeout: Duration,
}

impl DynamicExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            concurrency: DEFAULT_CONCURRENCY,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Run every task in `tasks`, respecting dependency order. Tasks with
    /// no unmet dependency run first, in descending priority; a task whose
    /// dependency failed or was skipped is itself skipped rather than run
    /// against incomplete data.
    pub async fn run(&self, tasks: Vec<ExecutionTask>, cancel: &CancellationToken) -> ExecutionResult {
        let start = Instant::now();
        let by_id: HashMap<String, ExecutionTask> =
            tasks.iter().map(|t| (t.agent_id.clone(), t.clone())).collect();

        let mut remaining: HashSet<String> = by_id.keys().cloned().collect();
        let mut done: HashMap<String, bool> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut outcomes = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<&ExecutionTask> = remaining
                .iter()
                .filter_map(|id| by_id.get(id))
                .filter(|t| t.dependencies.iter().all(|dep| done.contains_key(dep)))
                .collect();

            if ready.is_empty() {
                // Remaining tasks depend on something that never ran
                // (cancelled or a cyclic/missing dependency); skip them.
                for id in remaining.drain() {
                    outcomes.push(TaskOutcome {
                        agent_id: id,
                        success: false,
                        data: None,
                        error: Some("skipped: unmet dependency".to_string()),
                        tokens_used: 0,
                        tool_calls: 0,
                        findings_count: 0,
                        duration_ms: 0,
                    });
                }
                break;
            }

            ready.sort_by(|a, b| b.priority.cmp(&a.priority));
            let batch: Vec<ExecutionTask> = ready.into_iter().cloned().collect();
            for t in &batch {
                remaining.remove(&t.agent_id);
            }

            if cancel.is_cancelled() {
                for t in batch {
                    outcomes.push(TaskOutcome {
                        agent_id: t.agent_id,
                        success: false,
                        data: None,
                        error: Some("cancelled".to_string()),
                        tokens_used: 0,
                        tool_calls: 0,
                        findings_count: 0,
                        duration_ms: 0,
                    });
                }
                continue;
            }

            let mut handles = Vec::new();
            for t in batch {
                let permit = semaphore.clone();
                let runner = self.runner.clone();
                let cancel = cancel.clone();
                let timeout = self.task_timeout;
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore closed");
                    let task_start = Instant::now();
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => Err(Error::AgentCancelled),
                        result = tokio::time::timeout(timeout, runner.run(&t, &cancel)) => {
                            match result {
                                Ok(inner) => inner,
                                Err(_) => Err(Error::AgentTimeout(timeout)),
                            }
                        }
                    };
                    let duration_ms = task_start.elapsed().as_millis() as u64;
                    (t.agent_id, outcome, duration_ms)
                }));
            }

            for handle in handles {
                let (agent_id, result, duration_ms) = handle.await.unwrap_or_else(|e| {
                    (
                        "unknown".to_string(),
                        Err(Error::Unknown(format!("task panicked: {e}"))),
                        0,
                    )
                });

                match result {
                    Ok(data) => {
                        let tokens_used = data.get("tokens_used").and_then(|v| v.as_u64()).unwrap_or(0);
                        let tool_calls = data.get("tool_calls").and_then(|v| v.as_u64()).unwrap_or(0);
                        let findings_count =
                            data.get("findings").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
                        done.insert(agent_id.clone(), true);
                        outcomes.push(TaskOutcome {
                            agent_id,
                            success: true,
                            data: Some(data),
                            error: None,
                            tokens_used,
                            tool_calls,
                            findings_count,
                            duration_ms,
                        });
                    }
                    Err(e) => {
                        done.insert(agent_id.clone(), false);
                        outcomes.push(TaskOutcome {
                            agent_id,
                            success: false,
                            data: None,
                            error: Some(e.to_string()),
                            tokens_used: 0,
                            tool_calls: 0,
                            findings_count: 0,
                            duration_ms,
                        });
                    }
                }
            }
        }

        let success = outcomes.iter().all(|o| o.success);
        ExecutionResult {
            success,
            total_tokens: outcomes.iter().map(|o| o.tokens_used).sum(),
            total_tool_calls: outcomes.iter().map(|o| o.tool_calls).sum(),
            total_findings: outcomes.iter().map(|o| o.findings_count).sum(),
            wallclock_ms: start.elapsed().as_millis() as u64,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRunner {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskRunner for EchoRunner {
        async fn run(&self, task: &ExecutionTask, _cancel: &CancellationToken) -> Result<Value, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"tokens_used": 10, "tool_calls": 1, "findings": [], "agent": task.agent_id}))
        }
    }

    fn task(id: &str, deps: Vec<&str>, priority: i32) -> ExecutionTask {
        ExecutionTask {
            agent_id: id.to_string(),
            role: "recon".to_string(),
            task: "do work".to_string(),
            context: json!({}),
            priority,
            dependencies: deps.into_iter().map(str::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_independent_tasks_all_succeed() {
        let runner = Arc::new(EchoRunner { calls: AtomicUsize::new(0) });
        let executor = DynamicExecutor::new(runner.clone());
        let result = executor.run(vec![task("a", vec![], 0), task("b", vec![], 0)], &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.outcomes.len(), 2);
        assert_eq!(result.total_tokens, 20);
    }

    #[tokio::test]
    async fn test_dependent_task_runs_after_dependency() {
        let runner = Arc::new(EchoRunner { calls: AtomicUsize::new(0) });
        let executor = DynamicExecutor::new(runner);
        let result = executor
            .run(vec![task("b", vec!["a"], 0), task("a", vec![], 0)], &CancellationToken::new())
            .await;

        assert!(result.success);
        let a_idx = result.outcomes.iter().position(|o| o.agent_id == "a").unwrap();
        let b_idx = result.outcomes.iter().position(|o| o.agent_id == "b").unwrap();
        assert!(a_idx < b_idx);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_marks_tasks_cancelled() {
        let runner = Arc::new(EchoRunner { calls: AtomicUsize::new(0) });
        let executor = DynamicExecutor::new(runner);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.run(vec![task("a", vec![], 0)], &cancel).await;
        assert!(!result.success);
        assert_eq!(result.outcomes[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_missing_dependency_skips_dependent_task() {
        let runner = Arc::new(EchoRunner { calls: AtomicUsize::new(0) });
        let executor = DynamicExecutor::new(runner);
        let result = executor
            .run(vec![task("b", vec!["ghost"], 0)], &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert!(result.outcomes[0].error.as_ref().unwrap().contains("unmet dependency"));
    }
}
