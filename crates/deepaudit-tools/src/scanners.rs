//! External scanner wrappers: `semgrep_scan`, `bandit_scan`, `gitleaks_scan`,
//! `trufflehog_scan`, `npm_audit`, `safety_scan`, `osv_scan`. Each shells out
//! to a real scanner binary inside the sandbox against the read-only project
//! mount and returns its JSON output alongside a human-readable summary.
//!
//! Grounded in the original implementation's `smart_scan_tool.py` for the
//! "summarize by severity, point at the worst offenders" shape of output,
//! generalized from ad-hoc regex scanning to delegating to the real tools
//! the spec names — this crate doesn't reimplement semgrep's rule engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

use crate::path_validation::ProjectRoot;
use crate::sandbox::{SandboxConfig, SandboxExecutor, SandboxMounts};

/// Resolve a scanner target per the spec's path policy: try `.`; else the
/// literal; if it looks like the project's own directory name (a common
/// LLM mistake, echoing back the folder instead of a relative path), rewrite
/// to `.`; if still missing on the host, fall back to `.` with a warning.
fn resolve_scan_target(root: &ProjectRoot, target: &str) -> (String, Option<String>) {
    if target.trim().is_empty() || target == "." {
        return (".".to_string(), None);
    }

    let project_dirname = root.path().file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if target == project_dirname {
        return (".".to_string(), None);
    }

    match root.resolve_for_walk(Some(target)) {
        Ok(resolved) if resolved.exists() => (target.to_string(), None),
        _ => (
            ".".to_string(),
            Some(format!("scan target '{target}' not found under the project root; scanning '.' instead")),
        ),
    }
}

struct ScannerSpec {
    name: &'static str,
    description: &'static str,
    /// Build the full command line given the resolved, sandbox-relative target.
    command: fn(&str) -> String,
    network: bool,
}

const SCANNERS: &[ScannerSpec] = &[
    ScannerSpec {
        name: "semgrep_scan",
        description: "Run semgrep's default security rule set against the project",
        command: |target| format!("semgrep --config auto --json --quiet {target}"),
        network: false,
    },
    ScannerSpec {
        name: "bandit_scan",
        description: "Run bandit, a static analyzer for common Python security issues",
        command: |target| format!("bandit -r {target} -f json"),
        network: false,
    },
    ScannerSpec {
        name: "gitleaks_scan",
        description: "Scan for committed secrets with gitleaks",
        command: |target| format!("gitleaks detect --source {target} --no-git --report-format json --report-path -"),
        network: false,
    },
    ScannerSpec {
        name: "trufflehog_scan",
        description: "Scan for high-entropy secrets and known credential patterns with trufflehog",
        command: |target| format!("trufflehog filesystem {target} --json"),
        network: false,
    },
    ScannerSpec {
        name: "npm_audit",
        description: "Check a Node.js project's dependencies for known vulnerabilities",
        command: |target| format!("cd {target} && npm audit --json"),
        network: true,
    },
    ScannerSpec {
        name: "safety_scan",
        description: "Check a Python project's dependencies for known vulnerabilities",
        command: |target| format!("safety check -r {target}/requirements.txt --json"),
        network: true,
    },
    ScannerSpec {
        name: "osv_scan",
        description: "Check project dependencies against the OSV vulnerability database",
        command: |target| format!("osv-scanner --format json -r {target}"),
        network: true,
    },
];

pub struct ScannerTool {
    spec: &'static ScannerSpec,
    root: Arc<ProjectRoot>,
}

#[derive(Deserialize, Default)]
struct ScannerArgs {
    #[serde(default = "default_target")]
    target: String,
}

fn default_target() -> String {
    ".".to_string()
}

#[async_trait]
impl Tool for ScannerTool {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn description(&self) -> &str {
        self.spec.description
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new().add_property(
                "target",
                PropertySchema::string("Directory or file to scan, relative to the project root (default '.')"),
                false,
            ),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: ScannerArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let (resolved_target, warning) = resolve_scan_target(&self.root, &args.target);
        let command = (self.spec.command)(&resolved_target);

        let mounts = SandboxMounts::new(self.root.path())?;
        let config = SandboxConfig {
            network: self.spec.network,
            timeout: std::time::Duration::from_secs(120),
            ..SandboxConfig::default()
        };
        let result = SandboxExecutor::Kernel.execute(&command, &mounts, &config).await?;

        let parsed: Option<Value> = serde_json::from_str(&result.stdout).ok();
        let finding_count = parsed.as_ref().and_then(count_findings);

        let mut content = if let Some(warning) = &warning {
            format!("{warning}\n\n{}", result.stdout)
        } else {
            result.stdout.clone()
        };
        if content.trim().is_empty() && !result.stderr.trim().is_empty() {
            content = result.stderr.clone();
        }

        let mut output = ToolOutput::success(content).with_data(json!({
            "target": resolved_target,
            "exit_code": result.exit_code,
            "parsed": parsed,
            "finding_count": finding_count,
            "stderr": result.stderr,
        }));
        if let Some(count) = finding_count {
            output = output.with_metadata("finding_count", json!(count));
        }
        Ok(output)
    }
}

/// Scanners disagree on where their findings array lives; cover the common
/// shapes (`results`, `vulnerabilities`, `findings`) rather than parse each
/// tool's schema precisely — good enough for a finding-count summary, with
/// `create_vulnerability_report` doing the real normalization downstream.
fn count_findings(value: &Value) -> Option<usize> {
    for key in ["results", "vulnerabilities", "findings", "Issues", "issues"] {
        if let Some(arr) = value.get(key).and_then(Value::as_array) {
            return Some(arr.len());
        }
    }
    value.as_array().map(|a| a.len())
}

pub fn create_scanner_tools(root: Arc<ProjectRoot>) -> Vec<Box<dyn Tool>> {
    SCANNERS
        .iter()
        .map(|spec| Box::new(ScannerTool { spec, root: root.clone() }) as Box<dyn Tool>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scan_target_rewrites_project_dirname() {
        let dir = tempfile::tempdir().unwrap();
        let root = ProjectRoot::new(dir.path()).unwrap();
        let dirname = dir.path().file_name().unwrap().to_str().unwrap();
        let (resolved, warning) = resolve_scan_target(&root, dirname);
        assert_eq!(resolved, ".");
        assert!(warning.is_none());
    }

    #[test]
    fn test_resolve_scan_target_falls_back_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = ProjectRoot::new(dir.path()).unwrap();
        let (resolved, warning) = resolve_scan_target(&root, "does/not/exist");
        assert_eq!(resolved, ".");
        assert!(warning.is_some());
    }

    #[test]
    fn test_count_findings_checks_common_shapes() {
        let value = json!({"results": [1, 2, 3]});
        assert_eq!(count_findings(&value), Some(3));
    }

    #[tokio::test]
    async fn test_scanner_tool_names_match_spec() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tools = create_scanner_tools(root);
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        for expected in ["semgrep_scan", "bandit_scan", "gitleaks_scan", "trufflehog_scan", "npm_audit", "safety_scan", "osv_scan"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
