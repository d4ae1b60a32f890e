//! The shared think/act/observe loop (C13) every agent role runs through.
//!
//! Role variants differ only in system prompt, legal top-level actions, and
//! `Final Answer` shape (see `role.rs`); this module is the one state
//! machine all of them execute.

use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use deepaudit_core::{
    parse_structured_output, AgentState, CheckpointStore, CompletionRequest, Error, LlmClient, Message,
    ToolRegistry,
};
use deepaudit_graph::{EventType, GraphEvent, GraphEventBus};

use crate::role::AgentRole;

/// Small cap so an LLM that never emits a parseable block doesn't loop
/// forever; the caller fails the iteration once this is exceeded.
const EMPTY_RETRY_LIMIT: u32 = 5;
const PARSE_RETRY_LIMIT: u32 = 3;
const DUPLICATE_FAILURE_LIMIT: u32 = 3;
const OBSERVATION_CHAR_CAP: usize = 4000;

/// One parsed turn of the agent's response.
#[derive(Debug, Clone, Default)]
pub struct AgentStep {
    pub thought: Option<String>,
    pub action: Option<String>,
    pub action_input: Option<Value>,
    pub is_final: bool,
    pub final_answer: Option<Value>,
}

/// Terminal result of one `run()` of the ReAct loop, orchestrator or leaf.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub iterations: u32,
    pub tool_calls: u64,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub handoff: Option<Value>,
}

impl AgentResult {
    fn cancelled() -> Self {
        Self {
            success: false,
            data: None,
            error: Some("cancelled".to_string()),
            iterations: 0,
            tool_calls: 0,
            tokens_used: 0,
            duration_ms: 0,
            handoff: None,
        }
    }
}

/// The orchestrator-only extra actions (`dispatch_agent`, `summarize`).
/// Implemented by `orchestrator.rs`, which owns the child registry and the
/// running aggregated findings set; the loop only needs an observation
/// string back.
#[async_trait::async_trait]
pub trait OrchestratorOps: Send + Sync {
    async fn dispatch(&mut self, task: &Value, cancel: &CancellationToken) -> String;
    fn summarize(&self) -> String;
}

/// Extract the `Thought:` / `Action:` / `Action Input:` / `Final Answer:`
/// sections out of a raw LLM turn. An empty `text` never reaches here — the
/// caller checks that before calling.
pub fn parse_agent_step(text: &str) -> AgentStep {
    let thought_re = Regex::new(r"(?s)Thought:\s*(.*?)(?:Action:|Final Answer:|$)").unwrap();
    let final_re = Regex::new(r"(?s)Final Answer:\s*(.*)").unwrap();
    let action_re = Regex::new(r"Action:\s*(\w+)").unwrap();
    let action_input_re = Regex::new(r"(?s)Action Input:\s*(.*?)(?:Thought:|Action:|Observation:|$)").unwrap();

    let thought = thought_re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(tail) = final_re.captures(text).and_then(|c| c.get(1)) {
        let answer = parse_json_block(tail.as_str().trim());
        return AgentStep {
            thought,
            action: None,
            action_input: None,
            is_final: true,
            final_answer: Some(answer),
        };
    }

    let action = action_re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    let action_input = action_input_re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| parse_json_block(m.as_str().trim()));

    AgentStep {
        thought,
        action,
        action_input,
        is_final: false,
        final_answer: None,
    }
}

/// Strip a markdown code fence if present, then run the structured-output
/// parser; fall back to a sentinel object carrying the raw text so the
/// caller can still surface *something* to the LLM on the next turn.
fn parse_json_block(raw: &str) -> Value {
    let stripped = raw
        .strip_prefix("```json")
        .or_else(|| raw.strip_prefix("```"))
        .unwrap_or(raw)
        .strip_suffix("```")
        .unwrap_or(raw)
        .trim();

    match parse_structured_output(stripped) {
        Ok(v) => v,
        Err(_) => json!({ "raw_answer": raw }),
    }
}

fn truncate_observation(content: &str) -> String {
    if content.len() <= OBSERVATION_CHAR_CAP {
        return content.to_string();
    }
    format!(
        "{}...[output truncated, {} chars total]",
        &content[..OBSERVATION_CHAR_CAP],
        content.len()
    )
}

/// Everything the loop needs to run one agent to completion.
pub struct ReactLoop<'a> {
    pub role: AgentRole,
    pub llm: &'a LlmClient,
    pub tools: &'a ToolRegistry,
    pub events: &'a GraphEventBus,
    pub state: &'a mut AgentState,
    pub correlation_id: String,
    pub model: String,
    /// `None` disables checkpointing entirely (e.g. short-lived child agents
    /// a caller chooses not to persist).
    pub checkpoints: Option<CheckpointStore>,
}

impl<'a> ReactLoop<'a> {
    fn emit(&self, event_type: EventType, message: impl Into<String>) {
        let event = GraphEvent::new(event_type, message)
            .with_agent(self.state.agent_id.clone(), self.state.agent_name.clone())
            .with_iteration(self.state.iteration)
            .with_correlation(self.correlation_id.clone());
        self.events.publish(event);
    }

    /// Run the loop to completion: `messages` is the full seeded
    /// conversation (`[system_prompt, initial_user_message]`), `ops` is
    /// `Some` only for the orchestrator.
    pub async fn run(
        &mut self,
        mut messages: Vec<Message>,
        cancel: &CancellationToken,
        mut ops: Option<&mut dyn OrchestratorOps>,
    ) -> AgentResult {
        let start = Instant::now();
        self.state.start();
        self.emit(EventType::LlmStart, "agent started");

        let mut empty_retries = 0u32;
        let mut parse_retries = 0u32;
        let mut last_failed_action: Option<(String, Value)> = None;
        let mut duplicate_failures = 0u32;
        let mut all_findings: Vec<Value> = Vec::new();
        let mut handoff: Option<Value> = None;

        let result = loop {
            if cancel.is_cancelled() || self.state.should_stop() {
                if cancel.is_cancelled() {
                    break AgentResult::cancelled();
                }
                break self.finalize(false, None, Some("iteration limit reached".to_string()), start, handoff.take());
            }

            self.state.increment_iteration();
            if let Some(store) = &self.checkpoints {
                if let Err(e) = store.auto_checkpoint(self.state) {
                    self.emit(EventType::Warning, format!("auto checkpoint failed: {e}"));
                }
            }
            if self.state.is_approaching_max_iterations(0.85) && !self.state.max_iterations_warning_sent {
                self.state.max_iterations_warning_sent = true;
                messages.push(Message::user(
                    "You are approaching the iteration limit. Wrap up and provide your Final Answer soon.",
                ));
            }

            self.emit(EventType::LlmStart, format!("iteration {}", self.state.iteration));
            let request = CompletionRequest::new(messages.clone()).with_model(self.model.clone());
            let response = match self.llm.complete(request, cancel).await {
                Ok(r) => r,
                Err(e) => {
                    self.emit(EventType::Error, e.to_string());
                    break self.finalize(false, None, Some(e.to_string()), start, handoff.take());
                }
            };
            self.state.add_tokens(response.usage.total_tokens as u64);

            let text = response.message.content.as_text().unwrap_or("").to_string();
            if text.trim().is_empty() {
                empty_retries += 1;
                if empty_retries > EMPTY_RETRY_LIMIT {
                    break self.finalize(
                        false,
                        None,
                        Some(Error::LlmInvalidResponse("empty response retry limit exceeded".to_string()).to_string()),
                        start,
                        handoff.take(),
                    );
                }
                messages.push(Message::user(
                    "Your last response was empty. Respond using the Thought/Action/Action Input \
                     format, or Thought/Final Answer if you are done.",
                ));
                sleep(Duration::from_millis(200 * empty_retries as u64)).await;
                continue;
            }
            empty_retries = 0;

            let step = parse_agent_step(&text);
            messages.push(Message::assistant(text.clone()));

            if step.thought.is_none() && step.action.is_none() && !step.is_final {
                parse_retries += 1;
                if parse_retries > PARSE_RETRY_LIMIT {
                    break self.finalize(
                        false,
                        None,
                        Some("could not parse a Thought/Action or Final Answer block".to_string()),
                        start,
                        handoff.take(),
                    );
                }
                messages.push(Message::user(
                    "I could not parse that response. Use exactly the Thought/Action/Action Input \
                     format, or Thought/Final Answer.",
                ));
                continue;
            }
            parse_retries = 0;

            if let Some(thought) = &step.thought {
                self.emit(EventType::LlmThought, thought.clone());
            }

            if step.is_final {
                self.emit(EventType::LlmComplete, "final answer received");
                let final_answer = step.final_answer.clone().unwrap_or_else(|| json!({}));
                all_findings.extend(self.role.extract_raw_findings(&final_answer));
                handoff = final_answer.get("handoff").cloned();
                let mut data = final_answer;
                if let Value::Object(ref mut obj) = data {
                    obj.insert("findings".to_string(), Value::Array(all_findings.clone()));
                }
                break self.finalize(true, Some(data), None, start, handoff.take());
            }

            let Some(action) = step.action.clone() else {
                messages.push(Message::user(
                    "Please continue the analysis, choosing a tool to run, or provide your Final \
                     Answer if you are done.",
                ));
                continue;
            };
            let action_input = step.action_input.clone().unwrap_or_else(|| json!({}));
            self.emit(EventType::LlmAction, format!("action: {action}"));

            let observation = if self.role.allows_dispatch() && action == "dispatch_agent" {
                match ops.as_deref_mut() {
                    Some(ops) => {
                        self.emit(EventType::Dispatch, action_input.to_string());
                        let obs = ops.dispatch(&action_input, cancel).await;
                        self.emit(EventType::DispatchComplete, "child returned");
                        obs
                    }
                    None => "dispatch_agent is unavailable: no orchestrator context wired".to_string(),
                }
            } else if self.role.allows_dispatch() && action == "summarize" {
                ops.as_deref().map(|o| o.summarize()).unwrap_or_else(|| "(no summary available)".to_string())
            } else if self.role.allows_dispatch() && action == "finish" {
                self.emit(EventType::LlmComplete, "finish action received");
                let conclusion = action_input;
                let mut data = json!({ "findings": all_findings.clone() });
                if let Value::Object(ref mut obj) = data {
                    obj.insert("conclusion".to_string(), conclusion.get("conclusion").cloned().unwrap_or(conclusion));
                }
                break self.finalize(true, Some(data), None, start, handoff.take());
            } else {
                self.emit(EventType::ToolCall, action.clone());
                self.state.add_action(json!({ "tool": action, "input": action_input }));

                match self.tools.execute(&action, action_input.clone()).await {
                    Ok(output) => {
                        duplicate_failures = 0;
                        last_failed_action = None;
                        self.emit(EventType::ToolResult, action.clone());
                        truncate_observation(&output.content)
                    }
                    Err(e) => {
                        let failure_key = (action.clone(), action_input.clone());
                        if last_failed_action.as_ref() == Some(&failure_key) {
                            duplicate_failures += 1;
                        } else {
                            duplicate_failures = 1;
                            last_failed_action = Some(failure_key);
                        }

                        self.emit(EventType::Warning, format!("tool {action} failed: {e}"));

                        if duplicate_failures >= DUPLICATE_FAILURE_LIMIT {
                            duplicate_failures = 0;
                            last_failed_action = None;
                            format!(
                                "Error: {e}. This exact call has now failed {DUPLICATE_FAILURE_LIMIT} times in a \
                                 row — try a different tool or input, or conclude with Final Answer if you \
                                 cannot proceed."
                            )
                        } else {
                            format!("Error: {e}")
                        }
                    }
                }
            };

            self.emit(EventType::LlmObservation, truncate_observation(&observation));
            self.state.add_observation(json!({ "observation": observation }));
            messages.push(Message::user(format!("Observation: {observation}")));
        };

        result
    }

    fn finalize(
        &mut self,
        success: bool,
        data: Option<Value>,
        error: Option<String>,
        start: Instant,
        handoff: Option<Value>,
    ) -> AgentResult {
        if success {
            self.state.set_completed(data.clone());
        } else {
            self.state.set_failed(error.clone().unwrap_or_else(|| "unknown error".to_string()));
        }
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(self.state) {
                self.emit(EventType::Warning, format!("final checkpoint failed: {e}"));
            }
        }
        self.emit(
            EventType::Info,
            format!(
                "agent finished: success={success} iterations={} tool_calls={}",
                self.state.iteration, self.state.tool_calls
            ),
        );
        AgentResult {
            success,
            data,
            error,
            iterations: self.state.iteration,
            tool_calls: self.state.tool_calls,
            tokens_used: self.state.total_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
            handoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_with_action() {
        let text = "Thought: I should read the file\nAction: read_file\nAction Input: {\"path\": \"a.py\"}";
        let step = parse_agent_step(text);
        assert_eq!(step.thought.as_deref(), Some("I should read the file"));
        assert_eq!(step.action.as_deref(), Some("read_file"));
        assert_eq!(step.action_input.unwrap()["path"], "a.py");
        assert!(!step.is_final);
    }

    #[test]
    fn test_parse_final_answer() {
        let text = "Thought: done\nFinal Answer: {\"conclusion\": \"ok\"}";
        let step = parse_agent_step(text);
        assert!(step.is_final);
        assert_eq!(step.final_answer.unwrap()["conclusion"], "ok");
    }

    #[test]
    fn test_parse_final_answer_strips_markdown_fence() {
        let text = "Thought: done\nFinal Answer: ```json\n{\"findings\": []}\n```";
        let step = parse_agent_step(text);
        assert!(step.is_final);
        assert!(step.final_answer.unwrap()["findings"].is_array());
    }

    #[test]
    fn test_parse_truncated_action_input_is_repaired() {
        let text = "Thought: x\nAction: read_file\nAction Input: ```json\n{\"file_path\": \"a\", \"start_line\": 1";
        let step = parse_agent_step(text);
        assert_eq!(step.action.as_deref(), Some("read_file"));
        let input = step.action_input.unwrap();
        assert_eq!(input["file_path"], "a");
        assert_eq!(input["start_line"], 1);
    }

    #[test]
    fn test_parse_step_with_no_recognizable_block() {
        let step = parse_agent_step("I am thinking about this but did not format it properly");
        assert!(step.thought.is_none());
        assert!(step.action.is_none());
        assert!(!step.is_final);
    }

    #[test]
    fn test_truncate_observation_under_cap_is_unchanged() {
        assert_eq!(truncate_observation("short"), "short");
    }

    #[test]
    fn test_truncate_observation_over_cap_is_capped_with_notice() {
        let long = "x".repeat(OBSERVATION_CHAR_CAP + 500);
        let truncated = truncate_observation(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("truncated"));
    }
}
