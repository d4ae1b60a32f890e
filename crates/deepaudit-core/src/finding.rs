//! Canonicalization and deduplication of security findings.
//!
//! Agent roles report findings as loosely-structured JSON objects with
//! inconsistent field names (`location` vs `file_path`, `risk` vs
//! `severity`, ...). This module normalizes any such object into a
//! [`Finding`] and merges duplicates discovered by more than one agent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A canonicalized security finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub description: String,
    pub severity: String,
    pub vulnerability_type: String,
    pub file_path: Option<String>,
    pub line_start: Option<u32>,
    pub code_snippet: Option<String>,
    pub suggestion: Option<String>,
    pub is_verified: bool,
    pub discovered_by: Option<DiscoveredBy>,
    /// Any fields not recognized by the canonical schema, kept so nothing
    /// an agent reported is silently dropped.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredBy {
    pub agent_id: String,
    pub agent_name: String,
}

const GENERIC_TYPE_WORDS: &[&str] = &["vulnerability", "finding", "issue"];

/// Normalize an arbitrary JSON object claiming to describe a finding.
///
/// Unknown shapes are best-efforted: missing fields fall back to sane
/// defaults rather than erroring, since a dropped finding is worse than
/// an incompletely-labeled one.
pub fn normalize_finding(raw: &Value) -> Finding {
    let mut obj = match raw.as_object() {
        Some(map) => map.clone(),
        None => {
            let mut map = serde_json::Map::new();
            map.insert(
                "description".to_string(),
                Value::String(raw.to_string()),
            );
            map
        }
    };

    if let Some(location) = obj.remove("location") {
        if !obj.contains_key("file_path") {
            if let Some(s) = location.as_str() {
                if let Some((file, line)) = s.rsplit_once(':') {
                    obj.insert("file_path".to_string(), Value::String(file.to_string()));
                    if let Ok(n) = line.parse::<u32>() {
                        obj.insert("line_start".to_string(), Value::Number(n.into()));
                    }
                } else {
                    obj.insert("file_path".to_string(), location.clone());
                }
            }
        }
    }
    if let Some(file) = obj.remove("file") {
        obj.entry("file_path").or_insert(file);
    }
    if let Some(line) = obj.remove("line") {
        obj.entry("line_start").or_insert(line);
    }
    if let Some(risk) = obj.remove("risk") {
        obj.entry("severity").or_insert(risk);
    }
    if let Some(code) = obj.remove("code") {
        obj.entry("code_snippet").or_insert(code);
    }
    if let Some(recommendation) = obj.remove("recommendation") {
        obj.entry("suggestion").or_insert(recommendation);
    }
    if let Some(impact) = obj.remove("impact").and_then(|v| v.as_str().map(str::to_string)) {
        let description = obj
            .entry("description")
            .or_insert_with(|| Value::String(String::new()));
        if let Value::String(s) = description {
            if !s.is_empty() {
                s.push_str(" ");
            }
            s.push_str(&impact);
        }
    }

    let description = obj
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let vulnerability_type = match obj.remove("type") {
        Some(Value::String(t)) if !GENERIC_TYPE_WORDS.contains(&t.to_lowercase().as_str()) => t,
        _ => infer_vulnerability_type(&description),
    };

    let severity = obj
        .get("severity")
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "medium".to_string());

    let file_path = obj
        .get("file_path")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let line_start = obj.get("line_start").and_then(|v| v.as_u64()).map(|n| n as u32);
    let code_snippet = obj
        .get("code_snippet")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let suggestion = obj
        .get("suggestion")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let is_verified = obj
        .get("is_verified")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let title = obj
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| synthesize_title(&vulnerability_type, file_path.as_deref()));

    for known in [
        "title",
        "description",
        "severity",
        "vulnerability_type",
        "file_path",
        "line_start",
        "code_snippet",
        "suggestion",
        "is_verified",
        "discovered_by",
    ] {
        obj.remove(known);
    }

    Finding {
        title,
        description,
        severity,
        vulnerability_type,
        file_path,
        line_start,
        code_snippet,
        suggestion,
        is_verified,
        discovered_by: None,
        extra: obj.into_iter().collect(),
    }
}

fn infer_vulnerability_type(description: &str) -> String {
    let lower = description.to_lowercase();
    if lower.contains("command injection") || lower.contains("rce") {
        "command_injection"
    } else if lower.contains("sql injection") || lower.contains("sqli") {
        "sql_injection"
    } else if lower.contains("xss") {
        "xss"
    } else if lower.contains("path traversal") {
        "path_traversal"
    } else if lower.contains("ssrf") {
        "ssrf"
    } else if lower.contains("xxe") {
        "xxe"
    } else {
        "other"
    }
    .to_string()
}

fn synthesize_title(vulnerability_type: &str, file_path: Option<&str>) -> String {
    let pretty = vulnerability_type
        .split('_')
        .map(|word| {
            let mut c = word.chars();
            match c.next() {
                Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    match file_path.and_then(|p| p.rsplit('/').next()) {
        Some(basename) if !basename.is_empty() => format!("{pretty} in {basename}"),
        _ => format!("{pretty} Vulnerability"),
    }
}

fn normalize_for_fingerprint(path: &str) -> String {
    path.to_lowercase().trim_end_matches('/').to_string()
}

/// True if two findings describe the same underlying issue.
///
/// Exact match is `(file_path, line_start, vulnerability_type)`. Falls back
/// to a fuzzy match on file plus (same line OR overlapping description
/// prefix OR matching vulnerability type) to catch agents that report
/// slightly different line numbers or phrasing for the same bug.
pub fn fingerprints_match(a: &Finding, b: &Finding) -> bool {
    let (Some(a_file), Some(b_file)) = (a.file_path.as_deref(), b.file_path.as_deref()) else {
        return false;
    };
    if normalize_for_fingerprint(a_file) != normalize_for_fingerprint(b_file) {
        return false;
    }

    let exact = a.line_start == b.line_start
        && a.vulnerability_type.to_lowercase() == b.vulnerability_type.to_lowercase();
    if exact {
        return true;
    }

    let same_line = a.line_start.is_some() && a.line_start == b.line_start;
    let same_type = a.vulnerability_type.to_lowercase() == b.vulnerability_type.to_lowercase();
    let overlapping_desc = {
        let a_prefix: String = a.description.to_lowercase().chars().take(60).collect();
        let b_prefix: String = b.description.to_lowercase().chars().take(60).collect();
        !a_prefix.is_empty() && (a_prefix == b_prefix || b.description.to_lowercase().contains(&a_prefix))
    };

    same_line || overlapping_desc || same_type
}

/// Merge a newly-discovered finding into an existing one, preferring
/// verified data and the longer of the two titles.
pub fn merge_findings(existing: &mut Finding, new: &Finding) {
    if new.title.len() > existing.title.len() {
        existing.title = new.title.clone();
    }
    if existing.description.len() < new.description.len() {
        existing.description = new.description.clone();
    }
    if existing.code_snippet.is_none() {
        existing.code_snippet = new.code_snippet.clone();
    }
    if existing.suggestion.is_none() {
        existing.suggestion = new.suggestion.clone();
    }
    if existing.line_start.is_none() {
        existing.line_start = new.line_start;
    }
    existing.is_verified = existing.is_verified || new.is_verified;
}

/// Deduplicate a batch of raw finding payloads into canonical, merged
/// findings, in first-seen order.
pub fn normalize_and_dedup(raw_findings: &[Value]) -> Vec<Finding> {
    let mut findings: Vec<Finding> = Vec::new();
    for raw in raw_findings {
        let normalized = normalize_finding(raw);
        if let Some(existing) = findings.iter_mut().find(|f| fingerprints_match(f, &normalized)) {
            merge_findings(existing, &normalized);
        } else {
            findings.push(normalized);
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_location_split_into_file_and_line() {
        let f = normalize_finding(&json!({"location": "src/app.py:42", "description": "bad"}));
        assert_eq!(f.file_path.as_deref(), Some("src/app.py"));
        assert_eq!(f.line_start, Some(42));
    }

    #[test]
    fn test_generic_type_falls_back_to_keyword_inference() {
        let f = normalize_finding(&json!({
            "type": "Vulnerability",
            "description": "classic SQL injection in login handler"
        }));
        assert_eq!(f.vulnerability_type, "sql_injection");
    }

    #[test]
    fn test_severity_lowercased_and_defaulted() {
        let f = normalize_finding(&json!({"risk": "HIGH"}));
        assert_eq!(f.severity, "high");
        let f2 = normalize_finding(&json!({}));
        assert_eq!(f2.severity, "medium");
    }

    #[test]
    fn test_title_synthesized_from_type_and_basename() {
        let f = normalize_finding(&json!({
            "type": "xss",
            "file_path": "web/templates/index.html"
        }));
        assert_eq!(f.title, "Xss in index.html");
    }

    #[test]
    fn test_fingerprint_exact_match() {
        let a = normalize_finding(&json!({"file_path": "a.py", "line_start": 10, "type": "xss"}));
        let b = normalize_finding(&json!({"file_path": "A.py/", "line_start": 10, "type": "XSS"}));
        assert!(fingerprints_match(&a, &b));
    }

    #[test]
    fn test_fuzzy_fingerprint_same_line_different_type_label() {
        let a = normalize_finding(&json!({"file_path": "a.py", "line_start": 5, "description": "one"}));
        let b = normalize_finding(&json!({"file_path": "a.py", "line_start": 5, "description": "two"}));
        assert!(fingerprints_match(&a, &b));
    }

    #[test]
    fn test_normalize_and_dedup_merges_verified_flag() {
        let raw = vec![
            json!({"file_path": "a.py", "line_start": 1, "type": "xss", "description": "short"}),
            json!({"file_path": "a.py", "line_start": 1, "type": "xss", "description": "a much longer description", "is_verified": true}),
        ];
        let findings = normalize_and_dedup(&raw);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_verified);
        assert_eq!(findings[0].description, "a much longer description");
    }
}
