//! `create_vulnerability_report`, the only sanctioned way an agent
//! finalizes a finding. Runs whatever loosely-structured object the agent
//! hands over through `deepaudit_core::finding::normalize_finding`, so a
//! finding reported this way carries the same canonical shape regardless
//! of which agent role produced it.

use async_trait::async_trait;
use serde_json::{json, Value};

use deepaudit_core::finding::normalize_finding;
use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

pub struct CreateVulnerabilityReportTool;

#[async_trait]
impl Tool for CreateVulnerabilityReportTool {
    fn name(&self) -> &str {
        "create_vulnerability_report"
    }

    fn description(&self) -> &str {
        "Finalize a confirmed vulnerability as a structured finding. This is the only way to report a finding to the scan output."
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("title", PropertySchema::string("Short, specific summary of the vulnerability"), true)
                .add_property("description", PropertySchema::string("What the vulnerability is and why it matters"), true)
                .add_property(
                    "severity",
                    PropertySchema::enum_string("Severity", vec!["critical".into(), "high".into(), "medium".into(), "low".into()]),
                    true,
                )
                .add_property("vulnerability_type", PropertySchema::string("Vulnerability class, e.g. 'sql_injection'"), true)
                .add_property("file_path", PropertySchema::string("File the vulnerability was found in"), false)
                .add_property("line_start", PropertySchema::integer("Line number the vulnerability starts at"), false)
                .add_property("code_snippet", PropertySchema::string("The vulnerable code"), false)
                .add_property("suggestion", PropertySchema::string("Recommended fix"), false)
                .add_property("is_verified", PropertySchema::boolean("Whether this was confirmed by actual exploitation/reproduction"), false),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutput, Error> {
        if arguments.get("title").and_then(Value::as_str).map(str::trim).unwrap_or_default().is_empty() {
            return Err(Error::ToolInputInvalid { tool: self.name().into(), message: "'title' is required".into() });
        }
        if arguments.get("vulnerability_type").and_then(Value::as_str).map(str::trim).unwrap_or_default().is_empty() {
            return Err(Error::ToolInputInvalid { tool: self.name().into(), message: "'vulnerability_type' is required".into() });
        }

        let finding = normalize_finding(&arguments);
        let content = format!(
            "Recorded finding: [{}] {} ({})",
            finding.severity.to_uppercase(),
            finding.title,
            finding.vulnerability_type
        );
        let data = serde_json::to_value(&finding).map_err(Error::from)?;
        Ok(ToolOutput::success(content).with_data(json!({"finding": data})))
    }
}

pub fn create_report_tool() -> Box<dyn Tool> {
    Box::new(CreateVulnerabilityReportTool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_vulnerability_report_normalizes_finding() {
        let tool = CreateVulnerabilityReportTool;
        let out = tool
            .execute(json!({
                "title": "SQL injection in login handler",
                "description": "User input is concatenated directly into a query",
                "severity": "high",
                "vulnerability_type": "sql_injection",
                "file_path": "app/auth.py",
                "line_start": 42,
            }))
            .await
            .unwrap();
        assert!(out.content.contains("SQL injection"));
        assert!(out.data.is_some());
    }

    #[tokio::test]
    async fn test_create_vulnerability_report_requires_title() {
        let tool = CreateVulnerabilityReportTool;
        let err = tool.execute(json!({"vulnerability_type": "xss", "severity": "low", "description": "x"})).await.unwrap_err();
        assert_eq!(err.code(), "Tool.InputInvalid");
    }
}
