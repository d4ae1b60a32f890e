//! Persisted session state (§6 "Persisted state (outside core)"): the
//! snapshot `run` writes on completion for `graph`/`findings` to read back,
//! and the file-backed control mailbox `stop-agent`/`stop-all`/
//! `send-message` append to and a running `run` polls.

use std::path::PathBuf;

use deepaudit_core::Finding;
use deepaudit_graph::{AgentStatistics, AgentTree};
use serde::{Deserialize, Serialize};

use deepaudit_core::Error;

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deepaudit")
}

pub fn session_path() -> PathBuf {
    state_dir().join("session.json")
}

pub fn control_path() -> PathBuf {
    state_dir().join("control.jsonl")
}

pub fn checkpoint_dir() -> PathBuf {
    state_dir().join("checkpoints")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub task: String,
    pub root: String,
    pub correlation_id: String,
    pub success: bool,
    pub conclusion: Option<serde_json::Value>,
    pub tree: AgentTree,
    pub stats: AgentStatistics,
    pub findings: Vec<Finding>,
}

impl SessionSnapshot {
    pub fn save(&self) -> Result<(), Error> {
        let path = session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Config(format!("failed to create session dir: {e}")))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(Error::from)?;
        std::fs::write(&path, content).map_err(|e| Error::Config(format!("failed to write session snapshot: {e}")))
    }

    pub fn load() -> Result<Self, Error> {
        let path = session_path();
        let content = std::fs::read_to_string(&path)
            .map_err(|_| Error::Config(format!("no session snapshot at {}; run `deepaudit run` first", path.display())))?;
        serde_json::from_str(&content).map_err(Error::from)
    }
}

/// A command queued by a separate `deepaudit` invocation for a `run` in
/// progress to pick up on its next mailbox poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ControlCommand {
    StopAgent { agent_id: String },
    StopAll,
    SendMessage { agent_id: String, text: String },
}

/// Append a command to the mailbox for a running session to pick up.
/// Returns `true` if a session snapshot exists (best-effort signal that a
/// run is or was active); the caller doesn't get a synchronous ack since
/// there is no live connection to the other process.
pub fn enqueue_control_command(cmd: &ControlCommand) -> Result<bool, Error> {
    let path = control_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Config(format!("failed to create control dir: {e}")))?;
    }
    let mut line = serde_json::to_string(cmd).map_err(Error::from)?;
    line.push('\n');
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::Config(format!("failed to open control mailbox: {e}")))?;
    file.write_all(line.as_bytes()).map_err(|e| Error::Config(format!("failed to write control command: {e}")))?;
    Ok(session_path().exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_command_round_trips_through_json() {
        let cmd = ControlCommand::SendMessage { agent_id: "a1".into(), text: "hi".into() };
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: ControlCommand = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlCommand::SendMessage { agent_id, text } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(text, "hi");
            }
            _ => panic!("wrong variant"),
        }
    }
}
