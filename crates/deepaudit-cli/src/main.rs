//! `deepaudit`: control-plane binary for the multi-agent static security
//! auditor. Subcommands match §6's illustrative CLI, each returning one
//! JSON envelope to stdout and an exit code from the contract in §6/§7:
//! 0 success, 1 internal error, 2 cancellation, 3 iteration/budget
//! exceeded, 4 input validation failure.

mod config;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use deepaudit_agents::run_orchestrator;
use deepaudit_core::{CheckpointStore, Error, LlmClient, Provider, TokenBucketRateLimiter};
use deepaudit_graph::{AgentGraphRegistry, GraphController, GraphEventBus, MessageBus, DEFAULT_EVENT_BUFFER};
use deepaudit_providers::{AnthropicProvider, GeminiProvider, OpenAIProvider};
use deepaudit_tools::{create_tool_registry, ToolsConfig};

use config::Config;
use session::{enqueue_control_command, ControlCommand, SessionSnapshot};

#[derive(Parser)]
#[command(name = "deepaudit", author, version, about = "Multi-agent static security auditor", long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full audit against a project and print the resulting findings
    Run {
        /// What the audit should look for, e.g. "find injection vulnerabilities"
        task: String,
        /// Project root to scan
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Request a specific running agent to stop
    StopAgent {
        agent_id: String,
    },
    /// Request every running agent to stop
    StopAll,
    /// Send a message to a running agent
    SendMessage {
        agent_id: String,
        text: String,
    },
    /// Show the agent tree from the most recent run
    Graph,
    /// Show the findings collected by the most recent run
    Findings,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let (envelope, code) = dispatch(cli).await;
    println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| envelope.to_string()));
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> (Value, i32) {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return error_envelope(&e),
    };

    match cli.command {
        Commands::Run { task, root } => run_command(&config, task, root).await,
        Commands::StopAgent { agent_id } => control_command(ControlCommand::StopAgent { agent_id }),
        Commands::StopAll => control_command(ControlCommand::StopAll),
        Commands::SendMessage { agent_id, text } => control_command(ControlCommand::SendMessage { agent_id, text }),
        Commands::Graph => graph_command(),
        Commands::Findings => findings_command(),
    }
}

fn error_envelope(e: &Error) -> (Value, i32) {
    let code = match e {
        Error::ValidationInput(_) | Error::ValidationPathTraversal(_) | Error::ValidationFileSize { .. } => 4,
        Error::AgentCancelled => 2,
        Error::AgentIterationLimit(_) => 3,
        _ => 1,
    };
    (json!({ "success": false, "error": { "code": e.code(), "message": e.to_string() } }), code)
}

fn create_provider(config: &Config) -> Result<Arc<dyn Provider>, Error> {
    let api_key = config.resolve_api_key()?;
    let provider: Box<dyn Provider> = match config.provider.to_lowercase().as_str() {
        "anthropic" | "claude" => {
            let mut p = AnthropicProvider::new(&api_key).with_default_model(&config.model);
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url);
            }
            Box::new(p)
        }
        "gemini" | "google" => {
            let mut p = GeminiProvider::new(&api_key).with_default_model(&config.model);
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url);
            }
            Box::new(p)
        }
        _ => {
            let mut p = OpenAIProvider::new(&api_key).with_default_model(&config.model);
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url);
            }
            Box::new(p)
        }
    };
    Ok(Arc::from(provider))
}

async fn run_command(config: &Config, task: String, root: PathBuf) -> (Value, i32) {
    let root = match std::fs::canonicalize(&root) {
        Ok(p) => p,
        Err(e) => {
            return error_envelope(&Error::ValidationInput(format!("project root '{}' is not accessible: {e}", root.display())))
        }
    };

    let provider = match create_provider(config) {
        Ok(p) => p,
        Err(e) => return error_envelope(&e),
    };
    let llm = Arc::new(LlmClient::new(
        provider,
        TokenBucketRateLimiter::new("deepaudit-cli", config.rate_limit.requests_per_second, config.rate_limit.burst),
    ));

    let tools = match create_tool_registry(ToolsConfig::new(&root)) {
        Ok(r) => Arc::new(r),
        Err(e) => return error_envelope(&e),
    };

    let registry = AgentGraphRegistry::new();
    let events = GraphEventBus::new(DEFAULT_EVENT_BUFFER);
    let messages = MessageBus::new();
    let controller = GraphController::new(registry.clone(), messages);
    let cancel = CancellationToken::new();
    let correlation_id = format!("run-{}", std::process::id());

    let mailbox_offset = std::fs::metadata(session::control_path()).map(|m| m.len()).unwrap_or(0);
    let poller_controller = controller.clone();
    let poller_cancel = cancel.clone();
    let poller = tokio::spawn(poll_control_mailbox(poller_controller, mailbox_offset, poller_cancel));

    let checkpoints = CheckpointStore::new(session::checkpoint_dir());

    let project_info = json!({ "root": root.to_string_lossy() });
    let result = run_orchestrator(
        task.clone(),
        project_info,
        json!({}),
        registry.clone(),
        events,
        llm,
        config.model.clone(),
        tools,
        correlation_id.clone(),
        cancel,
        Some(checkpoints),
    )
    .await;

    poller.abort();

    let data = result.data.clone().unwrap_or_else(|| json!({}));
    let raw_findings = data.get("findings").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let findings: Vec<deepaudit_core::Finding> = raw_findings.iter().map(deepaudit_core::normalize_finding).collect();

    let (tree, stats, _view) = controller.agent_graph().await;
    let snapshot = SessionSnapshot {
        task,
        root: root.to_string_lossy().to_string(),
        correlation_id,
        success: result.success,
        conclusion: data.get("conclusion").cloned(),
        tree,
        stats,
        findings: findings.clone(),
    };
    if let Err(e) = snapshot.save() {
        tracing::warn!(error = %e, "failed to persist session snapshot");
    }

    let envelope = json!({
        "success": result.success,
        "error": result.error,
        "conclusion": snapshot.conclusion,
        "findings_summary": controller.findings_summary(&findings),
        "findings": findings,
        "iterations": result.iterations,
        "tool_calls": result.tool_calls,
        "tokens_used": result.tokens_used,
        "duration_ms": result.duration_ms,
    });

    let code = if result.success {
        0
    } else {
        match result.error.as_deref() {
            Some("cancelled") => 2,
            Some(msg) if msg.contains("iteration limit reached") => 3,
            _ => 1,
        }
    };

    (envelope, code)
}

async fn poll_control_mailbox(controller: GraphController, mut offset: u64, cancel: CancellationToken) {
    let path = session::control_path();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            let len = content.len() as u64;
            if len > offset {
                let fresh = &content[offset as usize..];
                offset = len;
                for line in fresh.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Ok(cmd) = serde_json::from_str::<ControlCommand>(line) {
                        apply_control_command(&controller, cmd).await;
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn apply_control_command(controller: &GraphController, cmd: ControlCommand) {
    match cmd {
        ControlCommand::StopAgent { agent_id } => {
            let result = controller.stop_agent(&agent_id).await;
            tracing::info!(agent_id = %result.agent_id, success = result.success, "stop-agent applied from mailbox");
        }
        ControlCommand::StopAll => {
            let result = controller.stop_all_agents(false).await;
            tracing::info!(stopped = result.stopped.len(), failed = result.failed.len(), "stop-all applied from mailbox");
        }
        ControlCommand::SendMessage { agent_id, text } => {
            let delivered = controller.send_user_message(&agent_id, text).await;
            tracing::info!(agent_id = %agent_id, delivered, "send-message applied from mailbox");
        }
    }
}

fn control_command(cmd: ControlCommand) -> (Value, i32) {
    match enqueue_control_command(&cmd) {
        Ok(session_exists) => (
            json!({
                "success": true,
                "queued": cmd_summary(&cmd),
                "note": if session_exists {
                    "queued for the running session's next mailbox poll (polled every 500ms)"
                } else {
                    "queued, but no session has run yet on this machine — it will be picked up if/when `deepaudit run` starts"
                },
            }),
            0,
        ),
        Err(e) => error_envelope(&e),
    }
}

fn cmd_summary(cmd: &ControlCommand) -> Value {
    match cmd {
        ControlCommand::StopAgent { agent_id } => json!({ "kind": "stop-agent", "agent_id": agent_id }),
        ControlCommand::StopAll => json!({ "kind": "stop-all" }),
        ControlCommand::SendMessage { agent_id, text } => json!({ "kind": "send-message", "agent_id": agent_id, "text": text }),
    }
}

fn graph_command() -> (Value, i32) {
    match SessionSnapshot::load() {
        Ok(snap) => (json!({ "success": true, "tree": snap.tree, "stats": snap.stats }), 0),
        Err(e) => error_envelope(&e),
    }
}

fn findings_command() -> (Value, i32) {
    match SessionSnapshot::load() {
        Ok(snap) => {
            let controller = GraphController::new(AgentGraphRegistry::new(), MessageBus::new());
            let summary = controller.findings_summary(&snap.findings);
            (json!({ "success": true, "summary": summary, "findings": snap.findings }), 0)
        }
        Err(e) => error_envelope(&e),
    }
}
