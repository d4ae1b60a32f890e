//! The read-only file surface (C6): `read_file`, `list_files`, `search_code`.
//!
//! Grounded in the base's `filesystem.rs::ReadFileTool`/`ListFilesTool`/
//! `SearchFilesTool`, trimmed to the spec's read-only contract — the write/
//! edit/move/copy/remove family has no counterpart in an auditor that must
//! never mutate the project it's scanning.

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

use crate::path_validation::ProjectRoot;

pub struct ReadFileTool {
    root: Arc<ProjectRoot>,
}

impl ReadFileTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize, Default)]
struct ReadFileArgs {
    path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
    #[serde(default)]
    max_lines: Option<usize>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents, optionally restricted to a line range"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("path", PropertySchema::string("Path to the file, relative to the project root"), true)
                .add_property("start_line", PropertySchema::integer("Starting line, 1-indexed inclusive"), false)
                .add_property("end_line", PropertySchema::integer("Ending line, 1-indexed inclusive"), false)
                .add_property("max_lines", PropertySchema::integer("Cap on lines returned (default 2000)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: ReadFileArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let resolved = self.root.resolve(&args.path)?;
        self.root.check_size(&resolved).await?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| Error::tool("read_file", format!("cannot read '{}': {e}", args.path)))?;

        let lines: Vec<&str> = content.lines().collect();
        let start = args.start_line.unwrap_or(1).max(1);
        let end = args.end_line.unwrap_or(lines.len()).min(lines.len());
        let max_lines = args.max_lines.unwrap_or(2000);

        if start > lines.len() {
            return Ok(ToolOutput::success(String::new()).with_metadata("truncated", serde_json::json!(false)));
        }

        let slice = &lines[start - 1..end.max(start).min(lines.len())];
        let capped: Vec<&str> = slice.iter().take(max_lines).copied().collect();
        let truncated = capped.len() < slice.len();

        let body: String = capped
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>5}\t{}", start + i, line))
            .collect::<Vec<_>>()
            .join("\n");

        let mut output = ToolOutput::success(body).with_metadata("total_lines", serde_json::json!(lines.len()));
        if truncated {
            output = output.with_metadata("truncated", serde_json::json!(true));
        }
        Ok(output)
    }
}

pub struct ListFilesTool {
    root: Arc<ProjectRoot>,
}

impl ListFilesTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize, Default)]
struct ListFilesArgs {
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    recursive: bool,
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a directory, respecting .gitignore"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("dir", PropertySchema::string("Directory, relative to the project root (default: root)"), false)
                .add_property("pattern", PropertySchema::string("Glob pattern to filter names, e.g. '*.py'"), false)
                .add_property("recursive", PropertySchema::boolean("Recurse into subdirectories (default: true)"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: ListFilesArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let base = self.root.resolve_for_walk(args.dir.as_deref())?;
        if !base.is_dir() {
            return Ok(ToolOutput::error(format!("'{}' is not a directory", args.dir.unwrap_or_default())));
        }

        let recursive = args.recursive;
        let pattern = args.pattern.as_deref().map(compile_glob);

        let mut walker = WalkBuilder::new(&base);
        walker.max_depth(if recursive { None } else { Some(1) }).hidden(false);

        let mut entries = Vec::new();
        for entry in walker.build().flatten() {
            let path = entry.path();
            if path == base || !path.is_file() {
                continue;
            }
            if let Some(re) = &pattern {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if !re.is_match(name) {
                    continue;
                }
            }
            if let Ok(rel) = path.strip_prefix(self.root.path()) {
                entries.push(rel.display().to_string());
            }
        }
        entries.sort();

        let count = entries.len();
        Ok(ToolOutput::success(entries.join("\n")).with_metadata("count", serde_json::json!(count)))
    }
}

/// Turn a shell-style glob (`*.py`) into an anchored regex for filename
/// matching; anything the caller passes that isn't a `*`/`?` is escaped.
fn compile_glob(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if "\\.+()[]{}|^$".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).unwrap_or_else(|_| Regex::new(".^").unwrap())
}

pub struct SearchCodeTool {
    root: Arc<ProjectRoot>,
}

impl SearchCodeTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize)]
struct SearchCodeArgs {
    keyword: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    regex: bool,
    #[serde(default = "default_context")]
    context: usize,
}

fn default_context() -> usize {
    0
}

const MAX_MATCHES: usize = 200;

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search file contents for a keyword or regex across the project"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("keyword", PropertySchema::string("Text or regex to search for"), true)
                .add_property("pattern", PropertySchema::string("Glob to restrict which files are searched, e.g. '*.py'"), false)
                .add_property("case_sensitive", PropertySchema::boolean("Case-sensitive match (default: false)"), false)
                .add_property("regex", PropertySchema::boolean("Treat 'keyword' as a regex (default: false)"), false)
                .add_property("context", PropertySchema::integer("Lines of context around each match"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: SearchCodeArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let needle = if args.regex { args.keyword.clone() } else { regex::escape(&args.keyword) };
        let re = Regex::new(&if args.case_sensitive { needle } else { format!("(?i){needle}") })
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: format!("invalid regex: {e}") })?;

        let name_filter = args.pattern.as_deref().map(compile_glob);
        let mut matches = Vec::new();
        let mut files_searched = 0usize;

        let walker = WalkBuilder::new(self.root.path()).hidden(false).build();
        'outer: for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(re_name) = &name_filter {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if !re_name.is_match(name) {
                    continue;
                }
            }
            if !is_text_file(path) {
                continue;
            }
            let Ok(content) = tokio::fs::read_to_string(path).await else { continue };
            files_searched += 1;

            let lines: Vec<&str> = content.lines().collect();
            for (idx, line) in lines.iter().enumerate() {
                if re.is_match(line) {
                    let rel = path.strip_prefix(self.root.path()).unwrap_or(path).display();
                    let lo = idx.saturating_sub(args.context);
                    let hi = (idx + args.context + 1).min(lines.len());
                    let snippet = lines[lo..hi].join("\n");
                    matches.push(format!("{rel}:{}\n{snippet}", idx + 1));
                    if matches.len() >= MAX_MATCHES {
                        break 'outer;
                    }
                }
            }
        }

        let truncated = matches.len() >= MAX_MATCHES;
        let body = matches.join("\n---\n");
        let mut output = ToolOutput::success(if body.is_empty() { "(no matches)".to_string() } else { body })
            .with_metadata("files_searched", serde_json::json!(files_searched))
            .with_metadata("match_count", serde_json::json!(matches.len()));
        if truncated {
            output = output.with_metadata("truncated", serde_json::json!(true));
        }
        Ok(output)
    }
}

pub fn create_file_tools(root: Arc<ProjectRoot>) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(ReadFileTool::new(root.clone())),
        Box::new(ListFilesTool::new(root.clone())),
        Box::new(SearchCodeTool::new(root)),
    ]
}

/// Cheap extension-based filter so a project-wide search doesn't waste time
/// reading binary assets that can never contain a textual match.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "webp", "pdf", "zip", "tar", "gz", "woff", "woff2", "ttf",
    "eot", "mp3", "mp4", "avi", "mov", "class", "jar", "wasm",
];

fn is_text_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => !BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, Arc<ProjectRoot>) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        (dir, root)
    }

    #[tokio::test]
    async fn test_read_file_respects_line_range() {
        let (_dir, root) = project(&[("a.py", "one\ntwo\nthree\nfour\n")]);
        let tool = ReadFileTool::new(root);
        let out = tool
            .execute(serde_json::json!({"path": "a.py", "start_line": 2, "end_line": 3}))
            .await
            .unwrap();
        assert!(out.content.contains("two"));
        assert!(out.content.contains("three"));
        assert!(!out.content.contains("four"));
    }

    #[tokio::test]
    async fn test_list_files_filters_by_pattern() {
        let (_dir, root) = project(&[("a.py", "x"), ("b.rs", "y"), ("sub/c.py", "z")]);
        let tool = ListFilesTool::new(root);
        let out = tool.execute(serde_json::json!({"pattern": "*.py"})).await.unwrap();
        assert!(out.content.contains("a.py"));
        assert!(out.content.contains("sub/c.py"));
        assert!(!out.content.contains("b.rs"));
    }

    #[tokio::test]
    async fn test_search_code_finds_keyword_case_insensitively() {
        let (_dir, root) = project(&[("a.py", "import os\nos.system(cmd)\n")]);
        let tool = SearchCodeTool::new(root);
        let out = tool.execute(serde_json::json!({"keyword": "OS.SYSTEM"})).await.unwrap();
        assert!(out.content.contains("os.system(cmd)"));
    }

    #[tokio::test]
    async fn test_search_code_reports_no_matches() {
        let (_dir, root) = project(&[("a.py", "print(1)\n")]);
        let tool = SearchCodeTool::new(root);
        let out = tool.execute(serde_json::json!({"keyword": "nonexistent_xyz"})).await.unwrap();
        assert_eq!(out.content, "(no matches)");
    }
}
