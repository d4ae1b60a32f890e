//! The orchestrator's dispatch mechanics (C14): the one role that extends
//! the shared ReAct loop with `dispatch_agent`/`summarize`/`finish`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use deepaudit_core::{
    merge_findings, normalize_finding, AgentState, CheckpointStore, Finding, LlmClient, Message, ToolRegistry,
};
use deepaudit_graph::{AgentGraphRegistry, GraphEventBus, NodeStatus};

use crate::react::{AgentResult, OrchestratorOps, ReactLoop};
use crate::role::AgentRole;

/// Sub-agents may be re-dispatched at most this many times each before the
/// orchestrator is told to stop or pick a different child.
const DEFAULT_DISPATCH_CAP: u32 = 2;

/// Everything the orchestrator needs to resolve, register, run, and merge
/// the results of a child agent.
pub struct OrchestratorContext {
    registry: AgentGraphRegistry,
    events: GraphEventBus,
    llm: Arc<LlmClient>,
    model: String,
    tools: Arc<ToolRegistry>,
    self_agent_id: String,
    correlation_id: String,
    project_info: Value,
    global_config: Value,
    dispatch_cap: u32,
    dispatch_counts: HashMap<String, u32>,
    previous_results: HashMap<String, Value>,
    findings: Vec<Finding>,
    checkpoints: Option<CheckpointStore>,
}

impl OrchestratorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_agent_id: impl Into<String>,
        correlation_id: impl Into<String>,
        project_info: Value,
        global_config: Value,
        registry: AgentGraphRegistry,
        events: GraphEventBus,
        llm: Arc<LlmClient>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            registry,
            events,
            llm,
            model: model.into(),
            tools,
            self_agent_id: self_agent_id.into(),
            correlation_id: correlation_id.into(),
            project_info,
            global_config,
            dispatch_cap: DEFAULT_DISPATCH_CAP,
            dispatch_counts: HashMap::new(),
            previous_results: HashMap::new(),
            findings: Vec::new(),
            checkpoints: None,
        }
    }

    pub fn with_dispatch_cap(mut self, cap: u32) -> Self {
        self.dispatch_cap = cap;
        self
    }

    /// Children inherit the same store (it's cheaply `Clone`), so a root
    /// agent and all its dispatched sub-agents checkpoint to one directory.
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    fn known_agent_names() -> &'static [&'static str] {
        &["recon", "analysis", "verification", "specialist"]
    }

    /// Merge one raw (pre-normalization) finding into the running set: dedup
    /// by fingerprint against everything collected so far, preferring
    /// longer text and promoting `is_verified`.
    fn merge_raw_finding(&mut self, raw: &Value) {
        let incoming = normalize_finding(raw);
        if let Some(existing) = self
            .findings
            .iter_mut()
            .find(|f| deepaudit_core::fingerprints_match(f, &incoming))
        {
            merge_findings(existing, &incoming);
        } else {
            self.findings.push(incoming);
        }
    }

    /// Build the role-aware summary of what a child produced, appended to
    /// the orchestrator's conversation as the dispatch observation.
    fn summarize_child_result(&self, role: AgentRole, data: &Value) -> String {
        let findings_count = data.get("findings").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
        match role {
            AgentRole::Recon => {
                let languages = data
                    .get("tech_stack")
                    .and_then(|t| t.get("languages"))
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                let entry_points = data.get("entry_points").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
                let high_risk = data.get("high_risk_areas").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
                format!(
                    "Recon mapped the project: {languages} language(s) detected, {entry_points} entry point(s), \
                     {high_risk} high-risk area(s) flagged, {findings_count} candidate finding(s)."
                )
            }
            AgentRole::Analysis => {
                format!("Analysis reported {findings_count} candidate finding(s).")
            }
            AgentRole::Verification => {
                let verified = data
                    .get("findings")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter(|f| f.get("is_verified").and_then(|v| v.as_bool()).unwrap_or(false)).count())
                    .unwrap_or(0);
                format!("Verification examined {findings_count} finding(s), confirmed {verified}.")
            }
            _ => format!("Child agent returned {findings_count} finding(s)."),
        }
    }

    fn findings_summary(&self) -> Value {
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for f in &self.findings {
            *by_severity.entry(f.severity.clone()).or_insert(0) += 1;
            *by_type.entry(f.vulnerability_type.clone()).or_insert(0) += 1;
        }
        json!({ "total": self.findings.len(), "by_severity": by_severity, "by_type": by_type })
    }
}

#[async_trait::async_trait]
impl OrchestratorOps for OrchestratorContext {
    async fn dispatch(&mut self, action_input: &Value, cancel: &CancellationToken) -> String {
        let Some(agent_name) = action_input.get("agent").and_then(|v| v.as_str()).map(|s| s.to_lowercase()) else {
            return "dispatch_agent requires an \"agent\" field naming the sub-agent to run.".to_string();
        };
        let task = action_input.get("task").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let Some(role) = AgentRole::from_str(&agent_name).filter(|r| !r.allows_dispatch()) else {
            return format!(
                "Unknown sub-agent \"{agent_name}\". Known agents: {}.",
                Self::known_agent_names().join(", ")
            );
        };

        let count = self.dispatch_counts.entry(agent_name.clone()).or_insert(0);
        if *count >= self.dispatch_cap {
            return format!(
                "\"{agent_name}\" has already been dispatched {count} time(s), the maximum allowed. \
                 Stop, or dispatch a different agent."
            );
        }
        *count += 1;

        let mut project_info = self.project_info.clone();
        if project_info.get("root").is_none() {
            if let Value::Object(ref mut obj) = project_info {
                obj.insert("root".to_string(), Value::String(".".to_string()));
            }
        }

        let child_input = json!({
            "task": task,
            "project_info": project_info,
            "global_config": self.global_config,
            "previous_results": self.previous_results,
            "findings": self.findings,
        });

        let child_id = format!("{}.{agent_name}", self.self_agent_id);
        let child_state = AgentState::new(agent_name.clone(), role.as_str(), task.clone()).with_parent(self.self_agent_id.clone());
        let child_cancel = cancel.clone();

        self.registry.unregister(&child_id).await;
        self.registry
            .register(
                child_id.clone(),
                agent_name.clone(),
                role.as_str(),
                task.clone(),
                Some(self.self_agent_id.clone()),
                Vec::new(),
                Arc::new(RwLock::new(child_state)),
                child_cancel.clone(),
            )
            .await;

        let Some(handle) = self.registry.state(&child_id).await else {
            return format!("internal error: failed to register sub-agent \"{agent_name}\"");
        };

        let result = {
            let mut state = handle.write().await;
            let system_prompt = role.build_system_prompt(&self.tools.definitions());
            let messages = vec![
                Message::system(system_prompt),
                Message::user(child_input.to_string()),
            ];

            let mut loop_ = ReactLoop {
                role,
                llm: self.llm.as_ref(),
                tools: self.tools.as_ref(),
                events: &self.events,
                state: &mut *state,
                correlation_id: self.correlation_id.clone(),
                model: self.model.clone(),
                checkpoints: self.checkpoints.clone(),
            };
            loop_.run(messages, &child_cancel, None).await
        };

        self.registry
            .update_status(&child_id, if result.success { NodeStatus::Completed } else { NodeStatus::Failed })
            .await;

        if !result.success {
            return format!(
                "\"{agent_name}\" failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        let data = result.data.clone().unwrap_or_else(|| json!({}));
        for raw in role.extract_raw_findings(&data) {
            self.merge_raw_finding(&raw);
        }
        // `extract_raw_findings` also re-reads `data.findings`, which the
        // child already populated via the same extraction inside its own
        // run — harmless, `merge_raw_finding` is idempotent against an
        // already-seen fingerprint.

        let summary = self.summarize_child_result(role, &data);
        self.previous_results.insert(agent_name, data);
        summary
    }

    fn summarize(&self) -> String {
        format!(
            "Summary so far: {} finding(s) collected across {} dispatched sub-agent(s). {}",
            self.findings.len(),
            self.previous_results.len(),
            self.findings_summary()
        )
    }
}

/// Run a full orchestrator audit from scratch: builds the root agent
/// state, registers it as the tree's root, seeds the conversation, and
/// runs the ReAct loop to completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_orchestrator(
    task: impl Into<String>,
    project_info: Value,
    global_config: Value,
    registry: AgentGraphRegistry,
    events: GraphEventBus,
    llm: Arc<LlmClient>,
    model: impl Into<String>,
    tools: Arc<ToolRegistry>,
    correlation_id: impl Into<String>,
    cancel: CancellationToken,
    checkpoints: Option<CheckpointStore>,
) -> AgentResult {
    let task = task.into();
    let model = model.into();
    let correlation_id = correlation_id.into();

    let root_state = AgentState::new("orchestrator", AgentRole::Orchestrator.as_str(), task.clone());
    let root_id = root_state.agent_id.clone();
    let handle = Arc::new(RwLock::new(root_state));

    registry
        .register(
            root_id.clone(),
            "orchestrator",
            AgentRole::Orchestrator.as_str(),
            task.clone(),
            None,
            Vec::new(),
            handle.clone(),
            cancel.clone(),
        )
        .await;

    let mut ctx = OrchestratorContext::new(
        root_id.clone(),
        correlation_id.clone(),
        project_info.clone(),
        global_config,
        registry.clone(),
        events.clone(),
        llm.clone(),
        model.clone(),
        tools.clone(),
    );
    if let Some(store) = checkpoints.clone() {
        ctx = ctx.with_checkpoints(store);
    }

    let system_prompt = AgentRole::Orchestrator.build_system_prompt(&tools.definitions());
    let initial_user_message = json!({
        "task": task,
        "project_info": project_info,
    });

    let result = {
        let mut state = handle.write().await;
        let mut loop_ = ReactLoop {
            role: AgentRole::Orchestrator,
            llm: llm.as_ref(),
            tools: tools.as_ref(),
            events: &events,
            state: &mut *state,
            correlation_id,
            model,
            checkpoints,
        };
        let messages = vec![
            Message::system(system_prompt),
            Message::user(initial_user_message.to_string()),
        ];
        loop_.run(messages, &cancel, Some(&mut ctx)).await
    };

    registry
        .update_status(&root_id, if result.success { NodeStatus::Completed } else { NodeStatus::Failed })
        .await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepaudit_core::testing::MockProvider;
    use deepaudit_core::TokenBucketRateLimiter;

    /// Responses are consumed in the order given, across every LLM call
    /// this test's whole orchestrator+children tree makes (the mock
    /// provider is shared, so order must match the exact call sequence).
    fn test_llm(responses: Vec<&str>) -> Arc<LlmClient> {
        let provider = Arc::new(MockProvider::new());
        for r in responses {
            provider.queue_response(r);
        }
        Arc::new(LlmClient::new(provider, TokenBucketRateLimiter::new("test", 100.0, 100.0)))
    }

    #[tokio::test]
    async fn test_single_iteration_finish() {
        let llm = test_llm(vec!["Thought: done\nAction: finish\nAction Input: {\"conclusion\":\"ok\"}"]);
        let result = run_orchestrator(
            "audit this repo",
            json!({"root": "."}),
            json!({}),
            AgentGraphRegistry::new(),
            GraphEventBus::new(16),
            llm,
            "stub-model",
            Arc::new(ToolRegistry::new()),
            "corr-1",
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.data.unwrap()["conclusion"], "ok");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_agent_reports_known_names() {
        let llm = test_llm(vec![
            "Thought: try a bad agent\nAction: dispatch_agent\nAction Input: {\"agent\":\"ghost\",\"task\":\"x\"}",
            "Thought: give up\nAction: finish\nAction Input: {\"conclusion\":\"done\"}",
        ]);
        let result = run_orchestrator(
            "audit",
            json!({"root": "."}),
            json!({}),
            AgentGraphRegistry::new(),
            GraphEventBus::new(16),
            llm,
            "stub-model",
            Arc::new(ToolRegistry::new()),
            "corr-2",
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn test_dispatch_and_merge_recon_high_risk_area() {
        let llm = test_llm(vec![
            "Thought: dispatch recon\nAction: dispatch_agent\nAction Input: {\"agent\":\"recon\",\"task\":\"map\"}",
            "Thought: mapped\nFinal Answer: {\"project_structure\":{},\"tech_stack\":{\"languages\":[\"py\"]},\
             \"entry_points\":[],\"high_risk_areas\":[\"app.py:36 - command injection\"],\"initial_findings\":[]}",
            "Thought: done\nAction: finish\nAction Input: {\"conclusion\":\"ok\"}",
        ]);

        let result = run_orchestrator(
            "audit",
            json!({"root": "."}),
            json!({}),
            AgentGraphRegistry::new(),
            GraphEventBus::new(16),
            llm,
            "stub-model",
            Arc::new(ToolRegistry::new()),
            "corr-3",
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(result.success);
        let findings = result.data.unwrap()["findings"].clone();
        let findings = findings.as_array().unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0]["vulnerability_type"], "command_injection");
        assert_eq!(findings[0]["file_path"], "app.py");
        assert_eq!(findings[0]["line_start"], 36);
        assert_eq!(findings[0]["severity"], "high");
    }
}
