//! deepaudit-tools: the concrete tool surface agents call through
//! `deepaudit_core::ToolRegistry`, plus the sandbox substrate (C7) those
//! tools execute against.
//!
//! Scope is deliberately narrower than the base this crate started from:
//! the auditor never mutates the project it's scanning, so there is no
//! write/edit/move/remove file surface, and there's no separate memory/web
//! tool set — semantic search and web access are expressed as the specific
//! tools this module wires up (`rag_query`, `sandbox_http`, …). The
//! agent-control surface (dispatching sub-agents, sending messages, ending
//! a scan) is handled by `deepaudit-agents`' `OrchestratorOps`, not by
//! tools in this registry — see `DESIGN.md` for that decision.

pub mod file_tools;
pub mod misc;
pub mod pattern_match;
pub mod path_validation;
pub mod report;
pub mod sandbox;
pub mod sandbox_tools;
pub mod scanners;
pub mod semantic;
pub mod vuln_tests;

pub use path_validation::ProjectRoot;

use std::path::PathBuf;
use std::sync::Arc;

use deepaudit_core::{Error, ToolRegistry};

/// Configuration for the default tool set: just the project root an
/// auditor run is confined to. Unlike the base this crate started from,
/// there's no `allow_write` toggle — every tool here is read-only or runs
/// inside the sandbox, by construction.
#[derive(Clone)]
pub struct ToolsConfig {
    pub root: PathBuf,
}

impl ToolsConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Build a registry carrying every tool in the auditor's surface, scoped
/// to the given project root.
pub fn create_tool_registry(config: ToolsConfig) -> Result<ToolRegistry, Error> {
    let root = Arc::new(ProjectRoot::new(&config.root)?);
    let mut registry = ToolRegistry::new();

    for tool in file_tools::create_file_tools(root.clone()) {
        registry.register(tool);
    }
    for tool in semantic::create_semantic_tools(root.clone()) {
        registry.register(tool);
    }
    registry.register(pattern_match::create_pattern_match_tool(root.clone()));
    for tool in sandbox_tools::create_sandbox_tools(root.clone()) {
        registry.register(tool);
    }
    for tool in scanners::create_scanner_tools(root.clone()) {
        registry.register(tool);
    }
    for tool in vuln_tests::create_vuln_test_tools(root.clone()) {
        registry.register(tool);
    }
    registry.register(report::create_report_tool());
    for tool in misc::create_misc_tools() {
        registry.register(tool);
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tool_registry_wires_every_tool_group() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_tool_registry(ToolsConfig::new(dir.path())).unwrap();
        for expected in [
            "read_file",
            "list_files",
            "search_code",
            "rag_query",
            "security_search",
            "function_context",
            "pattern_match",
            "sandbox_exec",
            "sandbox_http",
            "run_code",
            "python_test",
            "semgrep_scan",
            "osv_scan",
            "test_sql_injection",
            "universal_vuln_test",
            "create_vulnerability_report",
            "think",
            "reflect",
        ] {
            assert!(registry.get(expected).is_some(), "missing tool '{expected}'");
        }
    }
}
