//! `pattern_match`: fast regex scan for known-dangerous code shapes across
//! OWASP-style vulnerability classes, grounded in the original
//! implementation's `pattern_tool.py` pattern library. This is deliberately a
//! quick triage pass — matches still need an agent (or `verify_vulnerability`
//! / sandboxed reproduction) to confirm before becoming a finding.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use deepaudit_core::{Error, PropertySchema, Tool, ToolDefinition, ToolOutput, ToolParameters};

use crate::path_validation::ProjectRoot;

struct PatternEntry {
    regex: &'static str,
    name: &'static str,
}

struct VulnClass {
    severity: &'static str,
    description: &'static str,
    by_language: &'static [(&'static str, &'static [PatternEntry])],
    common: &'static [PatternEntry],
}

macro_rules! p {
    ($re:expr, $name:expr) => {
        PatternEntry { regex: $re, name: $name }
    };
}

static SQL_INJECTION_PY: &[PatternEntry] = &[
    p!(r#"cursor\.execute\s*\([^,)]+\+"#, "string concatenation into cursor.execute"),
    p!(r#"cursor\.execute\s*\(\s*f["']"#, "f-string built SQL"),
    p!(r#"\.execute\s*\(\s*["'][^"']*\{"#, "format() built SQL"),
];
static SQL_INJECTION_JS: &[PatternEntry] = &[
    p!(r#"\.query\s*\(\s*[`"'].*\$\{"#, "template literal built SQL"),
    p!(r#"\.query\s*\(\s*["'].*\+"#, "string concatenation into query()"),
];
static SQL_INJECTION_JAVA: &[PatternEntry] = &[
    p!(r#"Statement.*execute.*\+"#, "Statement string concatenation"),
    p!(r#"createQuery\s*\([^,)]+\+"#, "JPA query concatenation"),
];
static SQL_INJECTION_PHP: &[PatternEntry] = &[
    p!(r#"mysqli_query\s*\([^,]+,\s*["'].*\.\s*\$"#, "mysqli_query concatenation"),
    p!(r#"->query\s*\(\s*["'].*\.\s*\$"#, "PDO/query() concatenation"),
];
static SQL_INJECTION_GO: &[PatternEntry] = &[
    p!(r#"\.Query\s*\([^,)]+\+"#, "Query string concatenation"),
    p!(r#"\.Exec\s*\([^,)]+\+"#, "Exec string concatenation"),
];

static XSS_JS: &[PatternEntry] = &[
    p!(r#"innerHTML\s*=\s*[^;]+"#, "innerHTML assignment"),
    p!(r#"document\.write\s*\("#, "document.write"),
    p!(r#"dangerouslySetInnerHTML"#, "React dangerouslySetInnerHTML"),
];
static XSS_PY: &[PatternEntry] = &[
    p!(r#"\|\s*safe\b"#, "Django safe filter"),
    p!(r#"mark_safe\s*\("#, "Django mark_safe"),
];
static XSS_PHP: &[PatternEntry] = &[
    p!(r#"echo\s+\$_(?:GET|POST|REQUEST)"#, "direct echo of user input"),
];
static XSS_JAVA: &[PatternEntry] = &[
    p!(r#"out\.print(?:ln)?\s*\([^)]*request\.getParameter"#, "direct print of request parameter"),
];

static COMMAND_INJECTION_PY: &[PatternEntry] = &[
    p!(r#"os\.system\s*\([^)]*\+"#, "os.system concatenation"),
    p!(r#"os\.system\s*\(\s*f["']"#, "os.system f-string"),
    p!(r#"subprocess\.(?:call|run|Popen)\s*\([^)]*shell\s*=\s*True"#, "shell=True"),
    p!(r#"\beval\s*\("#, "eval()"),
    p!(r#"\bexec\s*\("#, "exec()"),
];
static COMMAND_INJECTION_JS: &[PatternEntry] = &[
    p!(r#"exec\s*\([^)]+\+"#, "exec() concatenation"),
    p!(r#"spawn\s*\([^)]+,\s*\{[^}]*shell:\s*true"#, "spawn with shell: true"),
    p!(r#"\beval\s*\("#, "eval()"),
];
static COMMAND_INJECTION_PHP: &[PatternEntry] = &[
    p!(r#"\bexec\s*\(\s*\$"#, "exec() on variable"),
    p!(r#"\bsystem\s*\(\s*\$"#, "system() on variable"),
    p!(r#"shell_exec\s*\(\s*\$"#, "shell_exec() on variable"),
    p!(r#"`[^`]*\$[^`]*`"#, "backtick command execution"),
];
static COMMAND_INJECTION_JAVA: &[PatternEntry] = &[
    p!(r#"Runtime\.getRuntime\(\)\.exec\s*\([^)]+\+"#, "Runtime.exec concatenation"),
    p!(r#"ProcessBuilder[^;]+\+"#, "ProcessBuilder concatenation"),
];
static COMMAND_INJECTION_GO: &[PatternEntry] = &[
    p!(r#"exec\.Command\s*\([^)]+\+"#, "exec.Command concatenation"),
];

static PATH_TRAVERSAL_PY: &[PatternEntry] = &[
    p!(r#"open\s*\([^)]*\+"#, "open() concatenation"),
    p!(r#"send_file\s*\([^)]*request"#, "send_file() on request input"),
];
static PATH_TRAVERSAL_JS: &[PatternEntry] = &[
    p!(r#"fs\.read(?:File|FileSync)\s*\([^)]+\+"#, "readFile concatenation"),
    p!(r#"res\.sendFile\s*\([^)]+\+"#, "sendFile concatenation"),
];
static PATH_TRAVERSAL_PHP: &[PatternEntry] = &[
    p!(r#"include\s*\(\s*\$"#, "include on variable"),
    p!(r#"file_get_contents\s*\(\s*\$"#, "file_get_contents on variable"),
];
static PATH_TRAVERSAL_JAVA: &[PatternEntry] = &[
    p!(r#"new\s+File\s*\([^)]+request\.getParameter"#, "File constructed from request parameter"),
];

static SSRF_PY: &[PatternEntry] = &[
    p!(r#"requests\.(?:get|post|put|delete)\s*\([^)]*request\."#, "requests call on user-controlled URL"),
    p!(r#"urllib\.request\.urlopen\s*\([^)]*request\."#, "urlopen on user-controlled URL"),
];
static SSRF_JS: &[PatternEntry] = &[
    p!(r#"fetch\s*\([^)]*req\."#, "fetch on user-controlled URL"),
    p!(r#"axios\.(?:get|post)\s*\([^)]*req\."#, "axios on user-controlled URL"),
];
static SSRF_JAVA: &[PatternEntry] = &[p!(r#"new\s+URL\s*\([^)]*request\.getParameter"#, "URL constructed from request parameter")];
static SSRF_PHP: &[PatternEntry] = &[p!(r#"curl_setopt[^;]+CURLOPT_URL[^;]+\$"#, "curl CURLOPT_URL on variable")];

static DESERIALIZATION_PY: &[PatternEntry] = &[
    p!(r#"pickle\.loads?\s*\("#, "pickle deserialization"),
    p!(r#"yaml\.unsafe_load\s*\("#, "yaml.unsafe_load"),
    p!(r#"marshal\.loads?\s*\("#, "marshal deserialization"),
];
static DESERIALIZATION_JAVA: &[PatternEntry] = &[
    p!(r#"ObjectInputStream\s*\("#, "ObjectInputStream"),
    p!(r#"XMLDecoder\s*\("#, "XMLDecoder"),
];
static DESERIALIZATION_PHP: &[PatternEntry] = &[p!(r#"unserialize\s*\(\s*\$"#, "unserialize on variable")];

static HARDCODED_SECRET_COMMON: &[PatternEntry] = &[
    p!(r#"(?:password|passwd|pwd)\s*=\s*["'][^"']{4,}["']"#, "hardcoded password"),
    p!(r#"(?:secret|api_?key|apikey|token|auth)\s*=\s*["'][^"']{8,}["']"#, "hardcoded secret"),
    p!(r#"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----"#, "embedded private key"),
    p!(r#"(?:ghp_|gho_|github_pat_)[a-zA-Z0-9]{36,}"#, "GitHub token"),
    p!(r#"sk-[a-zA-Z0-9]{48}"#, "OpenAI-style API key"),
];

static WEAK_CRYPTO_PY: &[PatternEntry] = &[
    p!(r#"hashlib\.md5\s*\("#, "MD5 hash"),
    p!(r#"hashlib\.sha1\s*\("#, "SHA1 hash"),
    p!(r#"random\.random\s*\("#, "non-cryptographic RNG"),
];
static WEAK_CRYPTO_JS: &[PatternEntry] = &[
    p!(r#"createHash\s*\(\s*["']md5["']"#, "MD5 hash"),
    p!(r#"Math\.random\s*\("#, "non-cryptographic RNG"),
];
static WEAK_CRYPTO_JAVA: &[PatternEntry] = &[p!(r#"MessageDigest\.getInstance\s*\(\s*["']MD5["']"#, "MD5 hash")];
static WEAK_CRYPTO_PHP: &[PatternEntry] = &[p!(r#"\bmd5\s*\("#, "MD5 hash"), p!(r#"\bsha1\s*\("#, "SHA1 hash")];

static PATTERN_LIBRARY: LazyLock<HashMap<&'static str, VulnClass>> = LazyLock::new(|| {
    HashMap::from([
        (
            "sql_injection",
            VulnClass {
                severity: "high",
                description: "SQL injection: user input concatenated directly into a query",
                by_language: &[
                    ("python", SQL_INJECTION_PY),
                    ("javascript", SQL_INJECTION_JS),
                    ("java", SQL_INJECTION_JAVA),
                    ("php", SQL_INJECTION_PHP),
                    ("go", SQL_INJECTION_GO),
                ],
                common: &[],
            },
        ),
        (
            "xss",
            VulnClass {
                severity: "high",
                description: "Cross-site scripting: unescaped user input rendered into a page",
                by_language: &[("javascript", XSS_JS), ("python", XSS_PY), ("php", XSS_PHP), ("java", XSS_JAVA)],
                common: &[],
            },
        ),
        (
            "command_injection",
            VulnClass {
                severity: "critical",
                description: "Command injection: user input used to build a shell command",
                by_language: &[
                    ("python", COMMAND_INJECTION_PY),
                    ("javascript", COMMAND_INJECTION_JS),
                    ("php", COMMAND_INJECTION_PHP),
                    ("java", COMMAND_INJECTION_JAVA),
                    ("go", COMMAND_INJECTION_GO),
                ],
                common: &[],
            },
        ),
        (
            "path_traversal",
            VulnClass {
                severity: "high",
                description: "Path traversal: user input reaches a filesystem path without sanitization",
                by_language: &[
                    ("python", PATH_TRAVERSAL_PY),
                    ("javascript", PATH_TRAVERSAL_JS),
                    ("php", PATH_TRAVERSAL_PHP),
                    ("java", PATH_TRAVERSAL_JAVA),
                ],
                common: &[],
            },
        ),
        (
            "ssrf",
            VulnClass {
                severity: "high",
                description: "SSRF: a server-side request is built from a user-controlled URL",
                by_language: &[("python", SSRF_PY), ("javascript", SSRF_JS), ("java", SSRF_JAVA), ("php", SSRF_PHP)],
                common: &[],
            },
        ),
        (
            "deserialization",
            VulnClass {
                severity: "critical",
                description: "Insecure deserialization: may lead to remote code execution",
                by_language: &[
                    ("python", DESERIALIZATION_PY),
                    ("java", DESERIALIZATION_JAVA),
                    ("php", DESERIALIZATION_PHP),
                ],
                common: &[],
            },
        ),
        (
            "hardcoded_secret",
            VulnClass {
                severity: "medium",
                description: "Hardcoded secret: sensitive material should never live in source",
                by_language: &[],
                common: HARDCODED_SECRET_COMMON,
            },
        ),
        (
            "weak_crypto",
            VulnClass {
                severity: "low",
                description: "Weak cryptography: an insecure hash or cipher is in use",
                by_language: &[
                    ("python", WEAK_CRYPTO_PY),
                    ("javascript", WEAK_CRYPTO_JS),
                    ("java", WEAK_CRYPTO_JAVA),
                    ("php", WEAK_CRYPTO_PHP),
                ],
                common: &[],
            },
        ),
    ])
});

fn detect_language(file_path: &str) -> Option<&'static str> {
    let lower = file_path.to_lowercase();
    let table: &[(&str, &str)] = &[
        (".py", "python"),
        (".js", "javascript"),
        (".jsx", "javascript"),
        (".ts", "javascript"),
        (".tsx", "javascript"),
        (".java", "java"),
        (".php", "php"),
        (".go", "go"),
        (".rb", "ruby"),
    ];
    table.iter().find(|(ext, _)| lower.ends_with(ext)).map(|(_, lang)| *lang)
}

#[derive(serde::Serialize)]
struct Hit {
    pattern_type: String,
    pattern_name: String,
    severity: String,
    description: String,
    line: usize,
    matched_text: String,
    context: String,
}

fn scan(code: &str, file_path: &str, types: &[String], language: Option<&str>) -> Vec<Hit> {
    let language = language.map(str::to_string).or_else(|| detect_language(file_path).map(str::to_string));
    let lines: Vec<&str> = code.lines().collect();
    let mut hits = Vec::new();

    let classes: Vec<&str> = if types.is_empty() {
        PATTERN_LIBRARY.keys().copied().collect()
    } else {
        types.iter().map(String::as_str).collect()
    };

    for vuln_type in classes {
        let Some(class) = PATTERN_LIBRARY.get(vuln_type) else { continue };
        let mut entries: Vec<&PatternEntry> = Vec::new();
        if let Some(lang) = &language {
            if let Some((_, pats)) = class.by_language.iter().find(|(l, _)| l == lang) {
                entries.extend(pats.iter());
            }
        }
        entries.extend(class.common.iter());
        if entries.is_empty() {
            for (_, pats) in class.by_language {
                entries.extend(pats.iter());
            }
        }

        for entry in entries {
            let Ok(re) = Regex::new(&format!("(?i){}", entry.regex)) else { continue };
            for (idx, line) in lines.iter().enumerate() {
                if re.is_match(line) {
                    let lo = idx.saturating_sub(2);
                    let hi = (idx + 3).min(lines.len());
                    let context = (lo..hi).map(|j| format!("{}: {}", j + 1, lines[j])).collect::<Vec<_>>().join("\n");
                    hits.push(Hit {
                        pattern_type: vuln_type.to_string(),
                        pattern_name: entry.name.to_string(),
                        severity: class.severity.to_string(),
                        description: class.description.to_string(),
                        line: idx + 1,
                        matched_text: line.trim().chars().take(200).collect(),
                        context,
                    });
                }
            }
        }
    }

    let order = |s: &str| match s {
        "critical" => 0,
        "high" => 1,
        "medium" => 2,
        _ => 3,
    };
    hits.sort_by_key(|h| order(&h.severity));
    hits
}

pub struct PatternMatchTool {
    root: Arc<ProjectRoot>,
}

impl PatternMatchTool {
    pub fn new(root: Arc<ProjectRoot>) -> Self {
        Self { root }
    }
}

#[derive(Deserialize, Default)]
struct PatternMatchArgs {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    scan_file: Option<String>,
    #[serde(default = "default_unknown")]
    file_path: String,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    language: Option<String>,
}

fn default_unknown() -> String {
    "unknown".to_string()
}

#[async_trait]
impl Tool for PatternMatchTool {
    fn name(&self) -> &str {
        "pattern_match"
    }

    fn description(&self) -> &str {
        "Fast regex scan of code for known-dangerous patterns across common vulnerability classes; matches are triage leads, not confirmed findings"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description()).with_parameters(
            ToolParameters::new()
                .add_property("code", PropertySchema::string("Code to scan (alternative to scan_file)"), false)
                .add_property("scan_file", PropertySchema::string("Path to scan, relative to the project root (alternative to code)"), false)
                .add_property("file_path", PropertySchema::string("File path used for context/language detection when using code"), false)
                .add_property(
                    "types",
                    PropertySchema::array("Vulnerability classes to check; empty means all", PropertySchema::string("Vulnerability class name")),
                    false,
                )
                .add_property("language", PropertySchema::string("Programming language override"), false),
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, Error> {
        let args: PatternMatchArgs = serde_json::from_value(arguments)
            .map_err(|e| Error::ToolInputInvalid { tool: self.name().into(), message: e.to_string() })?;

        let (code, file_path) = if let Some(scan_file) = &args.scan_file {
            let resolved = self.root.resolve(scan_file)?;
            self.root.check_size(&resolved).await?;
            let content = tokio::fs::read_to_string(&resolved)
                .await
                .map_err(|e| Error::tool(self.name(), format!("cannot read '{scan_file}': {e}")))?;
            (content, scan_file.clone())
        } else if let Some(code) = &args.code {
            (code.clone(), args.file_path.clone())
        } else {
            return Err(Error::ToolInputInvalid {
                tool: self.name().into(),
                message: "either 'code' or 'scan_file' must be provided".into(),
            });
        };

        let hits = scan(&code, &file_path, &args.types, args.language.as_deref());
        if hits.is_empty() {
            return Ok(ToolOutput::success("no known dangerous patterns detected").with_metadata("matches", json!(0)));
        }

        let mut by_severity: HashMap<&str, usize> = HashMap::new();
        for h in &hits {
            *by_severity.entry(h.severity.as_str()).or_default() += 1;
        }

        let body = hits
            .iter()
            .map(|h| {
                format!(
                    "[{}] {} at {}:{}\n  pattern: {}\n  {}\n{}",
                    h.severity.to_uppercase(),
                    h.pattern_type,
                    file_path,
                    h.line,
                    h.pattern_name,
                    h.description,
                    h.context
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        Ok(ToolOutput::success(body)
            .with_metadata("matches", json!(hits.len()))
            .with_metadata("by_severity", json!(by_severity))
            .with_data(json!(hits)))
    }
}

pub fn create_pattern_match_tool(root: Arc<ProjectRoot>) -> Box<dyn Tool> {
    Box::new(PatternMatchTool::new(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_command_injection_in_python_code() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tool = PatternMatchTool::new(root);
        let out = tool
            .execute(json!({
                "code": "import os\ndef run(cmd):\n    os.system(cmd + ' --force')\n",
                "file_path": "app.py",
            }))
            .await
            .unwrap();
        assert!(out.content.contains("command_injection"));
    }

    #[tokio::test]
    async fn test_reports_no_matches_for_clean_code() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tool = PatternMatchTool::new(root);
        let out = tool.execute(json!({"code": "def add(a, b):\n    return a + b\n", "file_path": "x.py"})).await.unwrap();
        assert!(out.content.contains("no known dangerous patterns"));
    }

    #[tokio::test]
    async fn test_scan_file_reads_from_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vuln.php"), "<?php unserialize($_GET['data']); ?>").unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tool = PatternMatchTool::new(root);
        let out = tool.execute(json!({"scan_file": "vuln.php", "types": ["deserialization"]})).await.unwrap();
        assert!(out.content.contains("deserialization"));
    }

    #[tokio::test]
    async fn test_requires_code_or_scan_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(ProjectRoot::new(dir.path()).unwrap());
        let tool = PatternMatchTool::new(root);
        assert!(tool.execute(json!({})).await.is_err());
    }
}
