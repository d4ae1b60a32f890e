//! Agent roles (C13/C14): the sealed enum role-specific behavior hangs off
//! of, and the system-prompt assembly every role shares.
//!
//! Role variants differ only in system prompt text, the set of legal
//! top-level actions, and the shape of `Final Answer`'s `findings[]`
//! payload — the ReAct loop itself (`react.rs`) is one implementation.

use serde_json::{json, Value};

use deepaudit_core::ToolDefinition;

/// A security-auditing agent's place in the dispatch tree.
///
/// Sealed on purpose: new behavior is a new variant plus a match arm here,
/// not a trait object hierarchy that could grow a role at runtime with no
/// corresponding system-prompt or action-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Orchestrator,
    Recon,
    Analysis,
    Verification,
    Specialist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Recon => "recon",
            Self::Analysis => "analysis",
            Self::Verification => "verification",
            Self::Specialist => "specialist",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "orchestrator" => Some(Self::Orchestrator),
            "recon" => Some(Self::Recon),
            "analysis" => Some(Self::Analysis),
            "verification" => Some(Self::Verification),
            "specialist" => Some(Self::Specialist),
            _ => None,
        }
    }

    pub fn all() -> [Self; 5] {
        [Self::Orchestrator, Self::Recon, Self::Analysis, Self::Verification, Self::Specialist]
    }

    /// Only the orchestrator may emit `dispatch_agent`/`summarize`/`finish`;
    /// every other role's only non-tool action is `Final Answer`.
    pub fn allows_dispatch(&self) -> bool {
        matches!(self, Self::Orchestrator)
    }

    /// Default iteration cap before `should_stop()` forces a halt.
    /// Recon's job is narrow and fast; the orchestrator has to wait out
    /// every child it dispatches, so it gets the longest budget.
    pub fn default_max_iterations(&self) -> u32 {
        match self {
            Self::Orchestrator => 40,
            Self::Recon => 15,
            Self::Analysis => 25,
            Self::Verification => 20,
            Self::Specialist => 20,
        }
    }

    fn persona(&self) -> &'static str {
        match self {
            Self::Orchestrator => {
                "You are the orchestrator of a static security audit. You do not read code \
                 yourself; you plan the audit, dispatch specialized sub-agents (recon, \
                 analysis, verification, specialist) to do the reading and testing, and \
                 merge their findings into one coherent report. Dispatch recon first to map \
                 the project before sending analysis or verification after specific leads."
            }
            Self::Recon => {
                "You are the recon agent. Your job is to map a codebase: identify the \
                 language/framework stack, list entry points (HTTP routes, CLI commands, \
                 message handlers), and flag areas that look risky at a glance (files \
                 touching user input, deserialization, shell execution, SQL construction). \
                 You do not prove vulnerabilities; you point at where to look."
            }
            Self::Analysis => {
                "You are the analysis agent, a vulnerability hunter. Given a codebase and \
                 (often) a recon report's high-risk areas, trace data flow from untrusted \
                 input to dangerous sinks and report concrete, file-and-line vulnerabilities. \
                 Verify a file exists and the line you cite actually contains what you claim \
                 before reporting a finding."
            }
            Self::Verification => {
                "You are the verification agent. Given a candidate vulnerability, attempt to \
                 prove or disprove it using the sandboxed execution tools available to you. \
                 A finding you verify should be marked verified in your Final Answer; a \
                 finding you could not reproduce should still be reported, unverified, with \
                 your reasoning."
            }
            Self::Specialist => {
                "You are a specialist agent dispatched for a narrow, well-defined sub-task \
                 (one file, one suspected vulnerability class, one follow-up question) that \
                 the orchestrator could not resolve with a general-purpose role. Stay within \
                 the scope of the task you were given."
            }
        }
    }

    /// The `findings[]` schema description inserted into the system prompt,
    /// and simultaneously the extraction contract `extract_final_findings`
    /// honors.
    fn findings_schema_hint(&self) -> &'static str {
        match self {
            Self::Recon => {
                "Final Answer must be a JSON object with `project_structure` (object), \
                 `tech_stack` (object), `entry_points` (array), `high_risk_areas` (array of \
                 strings, each ideally `\"path:line - reason\"`), and `initial_findings` \
                 (array, entries may be either finding objects or `\"path:line - description\"` \
                 strings)."
            }
            _ => {
                "Final Answer must be a JSON object with a `findings` array. Each finding is \
                 an object with `vulnerability_type`, `severity`, `title`, `description`, \
                 `file_path`, `line_start`, `code_snippet`, and `suggestion`."
            }
        }
    }

    fn action_hint(&self) -> &'static str {
        if self.allows_dispatch() {
            "In addition to tool names, you may use the action `dispatch_agent` (Action Input: \
             `{\"agent\": <role>, \"task\": <string>}`) to hand work to a sub-agent, \
             `summarize` to record a running summary observation, or `finish` (Action Input: \
             `{\"conclusion\": <string>}`) to end the audit once you judge it complete."
        } else {
            "You cannot dispatch sub-agents; your only non-tool action is `Final Answer`."
        }
    }

    /// Build the system prompt: persona, tool catalog, output-format
    /// contract, and the file-existence-before-reporting principle shared
    /// by every role.
    pub fn build_system_prompt(&self, tools: &[ToolDefinition]) -> String {
        let tool_list = if tools.is_empty() {
            "(no tools available)".to_string()
        } else {
            tools
                .iter()
                .map(|t| format!("- {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "{persona}\n\n\
             ## Available tools\n{tool_list}\n\n\
             ## Response format\n\
             Respond in one of two shapes:\n\n\
             Thought: <your reasoning>\n\
             Action: <tool name{dispatch_note}>\n\
             Action Input: <JSON object>\n\n\
             or, once you are done:\n\n\
             Thought: <your reasoning>\n\
             Final Answer: <JSON object>\n\n\
             {action_hint}\n\n\
             ## Output contract\n{findings_hint}\n\n\
             ## Core principle\n\
             Before reporting a finding, confirm the file exists and the cited line actually \
             contains what you claim — use a read tool to check, don't report from memory.",
            persona = self.persona(),
            tool_list = tool_list,
            dispatch_note = if self.allows_dispatch() { ", dispatch_agent, summarize, or finish" } else { "" },
            action_hint = self.action_hint(),
            findings_hint = self.findings_schema_hint(),
        )
    }

    /// Extract the raw (pre-normalization) finding dicts/strings from a
    /// role's `Final Answer` payload, per the role-specific schema above.
    /// Normalization/dedup happens downstream in the finding normalizer —
    /// this only locates the candidates.
    pub fn extract_raw_findings(&self, final_answer: &Value) -> Vec<Value> {
        let mut raw = Vec::new();

        if let Some(findings) = final_answer.get("findings").and_then(|v| v.as_array()) {
            raw.extend(findings.iter().cloned());
        }

        if matches!(self, Self::Recon) {
            if let Some(initial) = final_answer.get("initial_findings").and_then(|v| v.as_array()) {
                for entry in initial {
                    match entry {
                        Value::Object(_) => raw.push(entry.clone()),
                        Value::String(s) => {
                            if let Some(parsed) = parse_location_description(s) {
                                raw.push(parsed);
                            }
                        }
                        _ => {}
                    }
                }
            }

            if let Some(areas) = final_answer.get("high_risk_areas").and_then(|v| v.as_array()) {
                for entry in areas {
                    if let Some(s) = entry.as_str() {
                        if let Some(parsed) = parse_location_description(s) {
                            raw.push(parsed);
                        }
                    }
                }
            }
        }

        raw
    }
}

/// Parse a `"path:line - description"` string into a loose finding dict,
/// matching recon's `initial_findings`/`high_risk_areas` string shapes.
/// Returns `None` if the string has no `path:line` prefix to split on.
fn parse_location_description(s: &str) -> Option<Value> {
    let (location, rest) = s.split_once(" - ").unwrap_or((s, ""));
    let (path, line) = location.rsplit_once(':')?;
    let line_start: i64 = line.trim().parse().ok()?;

    Some(json!({
        "file_path": path.trim(),
        "line_start": line_start,
        "description": rest.trim(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_name() {
        for role in AgentRole::all() {
            assert_eq!(AgentRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(AgentRole::from_str("ORCHESTRATOR"), Some(AgentRole::Orchestrator));
        assert_eq!(AgentRole::from_str("nonsense"), None);
    }

    #[test]
    fn test_only_orchestrator_allows_dispatch() {
        assert!(AgentRole::Orchestrator.allows_dispatch());
        for role in [AgentRole::Recon, AgentRole::Analysis, AgentRole::Verification, AgentRole::Specialist] {
            assert!(!role.allows_dispatch());
        }
    }

    #[test]
    fn test_system_prompt_mentions_dispatch_only_for_orchestrator() {
        let prompt = AgentRole::Orchestrator.build_system_prompt(&[]);
        assert!(prompt.contains("dispatch_agent"));
        let prompt = AgentRole::Analysis.build_system_prompt(&[]);
        assert!(!prompt.contains("dispatch_agent,"));
    }

    #[test]
    fn test_recon_extracts_findings_from_all_three_shapes() {
        let final_answer = json!({
            "findings": [{"file_path": "a.py", "line_start": 1}],
            "initial_findings": ["app.py:36 - command injection via os.system", {"file_path": "b.py"}],
            "high_risk_areas": ["db.py:10 - string-built SQL query"],
        });

        let raw = AgentRole::Recon.extract_raw_findings(&final_answer);
        assert_eq!(raw.len(), 4);
        assert_eq!(raw[1]["file_path"], "app.py");
        assert_eq!(raw[1]["line_start"], 36);
        assert_eq!(raw[3]["file_path"], "db.py");
    }

    #[test]
    fn test_non_recon_role_only_reads_findings_key() {
        let final_answer = json!({
            "findings": [{"file_path": "a.py", "line_start": 1}],
            "initial_findings": ["ignored:1 - ignored"],
        });
        let raw = AgentRole::Analysis.extract_raw_findings(&final_answer);
        assert_eq!(raw.len(), 1);
    }
}
