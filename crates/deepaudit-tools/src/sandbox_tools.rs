//! Tool-facing wrappers around the sandbox substrate: `sandbox_exec`,
//! `sandbox_http`, `run_code`, and the per-language `*_test` convenience
//! wrappers. Each call gets its own ephemeral mount set (§4.7) — nothing
//! persists between invocations except what the project root already had.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

use crate::path_validation::ProjectRoot;
use crate::sandbox::{CommandResult, SandboxConfig, SandboxExecutor, SandboxMounts};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 120;

fn result_json(result: &CommandResult) -> serde_json::Value {
    json!({
        "success": result.success,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
        "error": result.error,
    })
}

fn clamp_timeout(requested: Option<u64>) -> Duration {
    Duration::from_secs(requested.unwrap_or(DEFAULT_TIMEOUT_SECS).min(MAX_TIMEOUT_SECS).max(1))
}

pub struct SandboxExecTool {
    root: Arc<ProjectRoot>,
}

impl SandboxExecTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct SandboxExecArgs {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for SandboxExecTool {
    fn name(&self) -> &str {
        "sandbox_exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in an isolated, read-only view of the project with no network access"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("command", PropertySchema::string("Command to run"), true)
                .add_property("timeout", PropertySchema::integer("Wall-clock timeout in seconds (default 30, max 120)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: SandboxExecArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let mounts = SandboxMounts::new(self.root.path())?;
        let config = SandboxConfig {
            timeout: clamp_timeout(args.timeout),
            ..SandboxConfig::default()
        };
        let result = SandboxExecutor::detect().execute(&args.command, &mounts, &config).await?;

        let content = if result.success {
            result.stdout.clone()
        } else {
            format!("{}\n{}", result.stdout, result.stderr)
        };
        let mut out = ToolOutput::success(content).with_data(result_json(&result));
        out.is_error = !result.success;
        Ok(out)
    }
}

pub struct SandboxHttpTool {
    root: Arc<ProjectRoot>,
}

impl SandboxHttpTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct SandboxHttpArgs {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[async_trait]
impl Tool for SandboxHttpTool {
    fn name(&self) -> &str {
        "sandbox_http"
    }

    fn description(&self) -> &str {
        "Issue an HTTP request from inside the sandbox with network temporarily enabled, for exercising a running target"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("method", PropertySchema::string("HTTP method (default GET)"), false)
                .add_property("url", PropertySchema::string("Target URL"), true)
                .add_property(
                    "headers",
                    PropertySchema::array("Extra headers as 'Name: value' strings", PropertySchema::string("header")),
                    false,
                )
                .add_property("body", PropertySchema::string("Request body"), false)
                .add_property("timeout", PropertySchema::integer("Wall-clock timeout in seconds (default 30, max 120)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: SandboxHttpArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let mut command = format!("curl -sS -X {} ", shell_quote(&args.method));
        for (name, value) in &args.headers {
            command.push_str(&format!("-H {} ", shell_quote(&format!("{name}: {value}"))));
        }
        if let Some(body) = &args.body {
            command.push_str(&format!("-d {} ", shell_quote(body)));
        }
        command.push_str(&shell_quote(&args.url));

        let mounts = SandboxMounts::new(self.root.path())?;
        let config = SandboxConfig {
            timeout: clamp_timeout(args.timeout),
            network: true,
            ..SandboxConfig::default()
        };
        // curl's argv contains quoting the direct-exec tokenizer can't
        // safely split, so HTTP requests always go through the kernel path.
        let result = SandboxExecutor::Kernel.execute(&command, &mounts, &config).await?;

        let mut out = ToolOutput::success(result.stdout.clone()).with_data(result_json(&result));
        out.is_error = !result.success;
        Ok(out)
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

struct LanguageRuntime {
    extension: &'static str,
    interpreter: fn(&str) -> String,
}

fn language_runtime(language: &str) -> Option<LanguageRuntime> {
    Some(match language.to_lowercase().as_str() {
        "python" => LanguageRuntime { extension: "py", interpreter: |f| format!("python3 {f}") },
        "javascript" | "js" | "node" => LanguageRuntime { extension: "js", interpreter: |f| format!("node {f}") },
        "php" => LanguageRuntime { extension: "php", interpreter: |f| format!("php {f}") },
        "ruby" => LanguageRuntime { extension: "rb", interpreter: |f| format!("ruby {f}") },
        "go" => LanguageRuntime { extension: "go", interpreter: |f| format!("go run {f}") },
        "shell" | "bash" | "sh" => LanguageRuntime { extension: "sh", interpreter: |f| format!("sh {f}") },
        "java" => LanguageRuntime {
            extension: "java",
            interpreter: |f| format!("cd $(dirname {f}) && javac $(basename {f}) && java -cp . $(basename {f} .java)"),
        },
        _ => return None,
    })
}

pub struct RunCodeTool {
    root: Arc<ProjectRoot>,
}

impl RunCodeTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }

    async fn run(&self, language: &str, source: &str, timeout: Option<u64>) -> Result<CommandResult, Error> {
        let runtime = language_runtime(language)
            .ok_or_else(|| Error::ToolInputInvalid { tool: "run_code".into(), message: format!("unsupported language '{language}'") })?;

        let mounts = SandboxMounts::new(self.root.path())?;
        let file_name = format!("snippet.{}", runtime.extension);
        let file_path = mounts.scratch_dir().join(&file_name);
        tokio::fs::write(&file_path, source)
            .await
            .map_err(|e| Error::tool("run_code", format!("cannot stage source file: {e}")))?;

        let command = (runtime.interpreter)(&format!("/tmp/{file_name}"));
        let config = SandboxConfig {
            timeout: clamp_timeout(timeout),
            ..SandboxConfig::default()
        };
        SandboxExecutor::detect().execute(&command, &mounts, &config).await
    }
}

#[derive(Deserialize)]
struct RunCodeArgs {
    language: String,
    source: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute a source snippet in the sandbox to confirm a suspected vulnerability behaves as described"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("language", PropertySchema::string("python, javascript, php, ruby, go, java, or shell"), true)
                .add_property("source", PropertySchema::string("Source code to run"), true)
                .add_property("timeout", PropertySchema::integer("Wall-clock timeout in seconds (default 30, max 120)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: RunCodeArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;
        let result = self.run(&args.language, &args.source, args.timeout).await?;
        let mut out = ToolOutput::success(format!("{}\n{}", result.stdout, result.stderr)).with_data(result_json(&result));
        out.is_error = !result.success;
        Ok(out)
    }
}

/// One `{language}_test` tool per supported language — a thin, fixed-language
/// wrapper around `run_code` so an agent prompt can say `python_test` instead
/// of `run_code(language="python", ...)`.
pub struct LanguageTestTool {
    name: &'static str,
    language: &'static str,
    root: Arc<ProjectRoot>,
}

impl LanguageTestTool {
    pub fn new(name: &'static str, language: &'static str, root: Arc<ProjectRoot>) -> Self {
        Self { name, language, root }
    }
}

#[derive(Deserialize)]
struct LanguageTestArgs {
    source: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for LanguageTestTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Execute a code snippet in the matching language sandbox"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("source", PropertySchema::string("Source code to run"), true)
                .add_property("timeout", PropertySchema::integer("Wall-clock timeout in seconds (default 30, max 120)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: LanguageTestArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;
        let runner = RunCodeTool::new(self.root.clone());
        let result = runner.run(self.language, &args.source, args.timeout).await?;
        let mut out = ToolOutput::success(format!("{}\n{}", result.stdout, result.stderr)).with_data(result_json(&result));
        out.is_error = !result.success;
        Ok(out)
    }
}

pub fn create_sandbox_tools(root: Arc<ProjectRoot>) -> Vec<Box<dyn Tool>> {
    let mut tools: Vec<Box<dyn Tool>> = vec![
        Box::new(SandboxExecTool::new(root.clone())),
        Box::new(SandboxHttpTool::new(root.clone())),
        Box::new(RunCodeTool::new(root.clone())),
    ];
    for (name, language) in [
        ("php_test", "php"),
        ("python_test", "python"),
        ("javascript_test", "javascript"),
        ("java_test", "java"),
        ("go_test", "go"),
        ("ruby_test", "ruby"),
        ("shell_test", "shell"),
    ] {
        tools.push(Box::new(LanguageTestTool::new(name, language, root.clone())));
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sandbox_exec_runs_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tool = SandboxExecTool::new(root);
        let out = tool.execute(json!({"command": "echo hi"})).await.unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_language_runtime_rejects_unknown_language() {
        assert!(language_runtime("cobol").is_none());
    }
}
