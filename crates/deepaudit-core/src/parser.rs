//! Structured-output parser (C9): pulls a JSON object out of an LLM
//! response through an escalating chain of repair strategies.
//!
//! Each stage is tried in order; the first one that yields a JSON object
//! wins. Later stages handle progressively more mangled input: markdown
//! fences, trailing commas, unescaped newlines inside strings, truncated
//! output missing closing braces.

use std::fmt;

use serde_json::Value;

#[derive(Debug)]
pub struct ParseError {
    pub attempts: Vec<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse JSON object: {}", self.attempts.join("; "))
    }
}

impl std::error::Error for ParseError {}

fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}'))
        .collect()
}

/// Strip trailing commas before a closing `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == ',' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                j += 1;
            }
            if j < bytes.len() && matches!(bytes[j] as char, '}' | ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Replace literal (unescaped) newlines found inside quoted string values
/// with `\n`, honoring string/escape state the same way
/// `extract_json_object` does. LLM output that embeds a multi-line value
/// (e.g. a `description` field) without escaping its newlines would
/// otherwise fail every later stage too.
fn escape_literal_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;
    for c in text.chars() {
        if escape_next {
            out.push(c);
            escape_next = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => {}
            _ => out.push(c),
        }
    }
    out
}

fn fix_json_format(text: &str) -> String {
    strip_trailing_commas(&escape_literal_newlines(text.trim()))
}

/// Last-resort stage: hand a best-effort `{...}` slice to a lenient parser
/// that tolerates trailing commas, single quotes, and unquoted keys.
fn repair_with_lenient_parser(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let slice = &text[start..=end];
    let value: Value = json5::from_str(slice).ok()?;
    serde_json::to_string(&value).ok()
}

fn extract_from_markdown(text: &str) -> Option<String> {
    let fence = text.find("```")?;
    let after_fence = &text[fence + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let close = after_fence.find("```")?;
    let body = after_fence[..close].trim();
    let obj_start = body.find('{')?;
    let obj_end = body.rfind('}')?;
    if obj_end < obj_start {
        return None;
    }
    Some(body[obj_start..=obj_end].to_string())
}

/// Balanced-brace scan honoring string/escape state, matching the
/// reference implementation's `extract_json_object`.
fn extract_json_object(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|&c| c == '{')?;

    let mut brace_count = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut end = None;

    for (i, &c) in chars.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            match c {
                '{' => brace_count += 1,
                '}' => {
                    brace_count -= 1;
                    if brace_count == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    let end = match end {
        Some(e) => e,
        None => {
            let last_brace = chars.iter().rposition(|&c| c == '}')?;
            if last_brace <= start {
                return None;
            }
            last_brace + 1
        }
    };

    let slice: String = chars[start..end].iter().collect();
    Some(strip_trailing_commas(&slice))
}

/// Close unterminated braces/brackets by counting openers vs closers.
fn fix_truncated_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut json_str = text[start..].to_string();

    let open_braces = json_str.matches('{').count();
    let close_braces = json_str.matches('}').count();
    let open_brackets = json_str.matches('[').count();
    let close_brackets = json_str.matches(']').count();

    json_str.push_str(&"]".repeat(open_brackets.saturating_sub(close_brackets)));
    json_str.push_str(&"}".repeat(open_braces.saturating_sub(close_braces)));

    Some(strip_trailing_commas(&json_str))
}

/// Run the full escalation chain against raw LLM output and return the
/// first stage that parses to a JSON object.
pub fn parse_structured_output(text: &str) -> Result<Value, ParseError> {
    let mut attempts = Vec::new();

    if text.trim().is_empty() {
        return Err(ParseError {
            attempts: vec!["empty input".to_string()],
        });
    }

    let clean = clean_text(text);

    let candidates: Vec<(&str, Option<String>)> = vec![
        ("direct", Some(text.to_string())),
        ("cleaned", Some(fix_json_format(&clean))),
        ("markdown", extract_from_markdown(text)),
        ("balanced_brace", extract_json_object(&clean)),
        ("truncated_repair", fix_truncated_json(&clean)),
        ("lenient_repair", repair_with_lenient_parser(&clean)),
    ];

    for (stage, candidate) in candidates {
        let Some(candidate) = candidate else {
            attempts.push(format!("{stage}: no candidate"));
            continue;
        };
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => attempts.push(format!("{stage}: not an object")),
            Err(e) => attempts.push(format!("{stage}: {e}")),
        }
    }

    Err(ParseError { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let v = parse_structured_output(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_trailing_comma_cleaned() {
        let v = parse_structured_output("{\"a\": 1, \"b\": [1, 2,],}").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_markdown_fenced() {
        let text = "Here is the result:\n```json\n{\"finding\": \"sqli\"}\n```\nThanks.";
        let v = parse_structured_output(text).unwrap();
        assert_eq!(v["finding"], "sqli");
    }

    #[test]
    fn test_balanced_brace_with_preamble_and_trailer() {
        let text = "Sure, the answer is {\"x\": {\"y\": 1}} and nothing else.";
        let v = parse_structured_output(text).unwrap();
        assert_eq!(v["x"]["y"], 1);
    }

    #[test]
    fn test_braces_inside_string_do_not_confuse_scan() {
        let text = r#"{"note": "use { and } carefully", "ok": true}"#;
        let v = parse_structured_output(text).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn test_truncated_json_repaired() {
        let text = r#"{"findings": [{"title": "a", "severity": "high""#;
        let v = parse_structured_output(text).unwrap();
        assert!(v["findings"].is_array());
    }

    #[test]
    fn test_unparseable_returns_all_attempts() {
        let err = parse_structured_output("not json at all, no braces").unwrap_err();
        assert!(!err.attempts.is_empty());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(parse_structured_output("   ").is_err());
    }

    #[test]
    fn test_unescaped_newline_in_string_repaired() {
        let text = "{\"description\": \"line one\nline two\", \"ok\": true}";
        let v = parse_structured_output(text).unwrap();
        assert_eq!(v["description"], "line one\nline two");
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn test_lenient_repair_last_resort() {
        // single-quoted keys/values and a trailing comma defeat every
        // earlier stage; the lenient parser is the last resort.
        let text = "{'title': 'unquoted-ish', 'severity': 'high',}";
        let v = parse_structured_output(text).unwrap();
        assert_eq!(v["title"], "unquoted-ish");
    }
}
