//! Agent state and checkpointing (C10).
//!
//! `AgentState` tracks one agent's full lifecycle: status transitions,
//! iteration counting, waiting-for-input timeouts, conversation/action/
//! observation logs, and accumulated findings. `Checkpoint` is the
//! on-disk snapshot shape, one JSON file per `(agent_id, sequence)`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

fn generate_agent_id() -> String {
    format!("agent_{}", &uuid_hex()[..8])
}

fn uuid_hex() -> String {
    // Teacher-aligned: agent ids are informal, collision-tolerant labels,
    // not security tokens, so a cheap random hex source is enough.
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Stopped,
    Stopping,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Stopped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEntry<T> {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub observation: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

/// Full lifecycle state for one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    pub parent_id: Option<String>,

    pub task: String,
    pub task_context: HashMap<String, Value>,
    pub inherited_context: HashMap<String, Value>,

    pub knowledge_modules: Vec<String>,

    pub status: AgentStatus,
    pub iteration: u32,
    pub max_iterations: u32,

    pub messages: Vec<HistoryMessage>,
    pub system_prompt: String,

    pub actions_taken: Vec<TimestampedEntry<ActionRecord>>,
    pub observations: Vec<TimestampedEntry<ObservationRecord>>,
    pub errors: Vec<String>,

    pub findings: Vec<Value>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub waiting_for_input: bool,
    pub waiting_start_time: Option<DateTime<Utc>>,
    pub waiting_reason: String,
    pub waiting_timeout_seconds: i64,

    pub final_result: Option<Value>,

    pub total_tokens: u64,
    pub tool_calls: u64,

    pub stop_requested: bool,
    pub max_iterations_warning_sent: bool,
}

impl AgentState {
    pub fn new(agent_name: impl Into<String>, agent_type: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: generate_agent_id(),
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            parent_id: None,
            task: task.into(),
            task_context: HashMap::new(),
            inherited_context: HashMap::new(),
            knowledge_modules: Vec::new(),
            status: AgentStatus::Created,
            iteration: 0,
            max_iterations: 50,
            messages: Vec::new(),
            system_prompt: String::new(),
            actions_taken: Vec::new(),
            observations: Vec::new(),
            errors: Vec::new(),
            findings: Vec::new(),
            created_at: now,
            started_at: None,
            last_updated: now,
            finished_at: None,
            waiting_for_input: false,
            waiting_start_time: None,
            waiting_reason: String::new(),
            waiting_timeout_seconds: 600,
            final_result: None,
            total_tokens: 0,
            tool_calls: 0,
            stop_requested: false,
            max_iterations_warning_sent: false,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    // ---- lifecycle ----

    pub fn start(&mut self) {
        self.status = AgentStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
        self.touch();
    }

    pub fn set_completed(&mut self, final_result: Option<Value>) {
        self.status = AgentStatus::Completed;
        self.final_result = final_result;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Failed;
        self.add_error(error);
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
        self.status = AgentStatus::Stopping;
        self.touch();
    }

    pub fn set_stopped(&mut self) {
        self.status = AgentStatus::Stopped;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    // ---- waiting state ----

    pub fn enter_waiting_state(&mut self, reason: impl Into<String>) {
        self.waiting_for_input = true;
        self.waiting_start_time = Some(Utc::now());
        self.waiting_reason = reason.into();
        self.status = AgentStatus::Waiting;
        self.touch();
    }

    pub fn resume_from_waiting(&mut self, new_task: Option<String>) {
        self.waiting_for_input = false;
        self.waiting_start_time = None;
        self.waiting_reason.clear();
        self.stop_requested = false;
        self.status = AgentStatus::Running;
        if let Some(task) = new_task {
            self.task = task;
        }
        self.touch();
    }

    pub fn has_waiting_timeout(&self) -> bool {
        if !self.waiting_for_input {
            return false;
        }
        let Some(start) = self.waiting_start_time else {
            return false;
        };
        if self.stop_requested || matches!(self.status, AgentStatus::Completed | AgentStatus::Failed) {
            return false;
        }
        let elapsed = (Utc::now() - start).num_seconds();
        elapsed > self.waiting_timeout_seconds
    }

    pub fn is_waiting_for_input(&self) -> bool {
        self.waiting_for_input
    }

    // ---- execution control ----

    pub fn should_stop(&self) -> bool {
        self.stop_requested || self.status.is_terminal() || self.has_reached_max_iterations()
    }

    pub fn has_reached_max_iterations(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    pub fn is_approaching_max_iterations(&self, threshold: f64) -> bool {
        self.iteration >= (self.max_iterations as f64 * threshold) as u32
    }

    // ---- message log ----

    pub fn add_message(&mut self, role: impl Into<String>, content: Value) {
        self.messages.push(HistoryMessage {
            role: role.into(),
            content,
            timestamp: Utc::now(),
        });
        self.touch();
    }

    /// Conversation history without timestamps, ready for an LLM request.
    pub fn get_conversation_history(&self) -> Vec<(String, Value)> {
        self.messages
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect()
    }

    // ---- execution records ----

    pub fn add_action(&mut self, action: Value) {
        self.actions_taken.push(TimestampedEntry {
            iteration: self.iteration,
            timestamp: Utc::now(),
            entry: ActionRecord { action },
        });
        self.tool_calls += 1;
        self.touch();
    }

    pub fn add_observation(&mut self, observation: Value) {
        self.observations.push(TimestampedEntry {
            iteration: self.iteration,
            timestamp: Utc::now(),
            entry: ObservationRecord { observation },
        });
        self.touch();
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(format!("Iteration {}: {}", self.iteration, error.into()));
        self.touch();
    }

    pub fn add_finding(&mut self, mut finding: Value) {
        if let Some(obj) = finding.as_object_mut() {
            obj.insert("discovered_at".to_string(), Value::String(Utc::now().to_rfc3339()));
            obj.insert("discovered_by".to_string(), Value::String(self.agent_id.clone()));
        }
        self.findings.push(finding);
        self.touch();
    }

    // ---- context ----

    pub fn update_context(&mut self, key: impl Into<String>, value: Value) {
        self.task_context.insert(key.into(), value);
        self.touch();
    }

    pub fn inherit_context(&mut self, parent_context: HashMap<String, Value>) {
        self.inherited_context = parent_context;
        self.touch();
    }

    // ---- stats and summary ----

    pub fn add_tokens(&mut self, tokens: u64) {
        self.total_tokens += tokens;
        self.touch();
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// A durable snapshot of one agent's state, one file per `(agent_id, sequence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub agent_id: String,
    pub sequence: u64,
    pub saved_at: DateTime<Utc>,
    pub state: AgentState,
}

pub const CHECKPOINT_VERSION: u32 = 1;

impl Checkpoint {
    pub fn new(sequence: u64, state: AgentState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            agent_id: state.agent_id.clone(),
            sequence,
            saved_at: Utc::now(),
            state,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{:010}.json", self.agent_id, self.sequence)
    }
}

struct CheckpointStoreInner {
    dir: PathBuf,
    auto_checkpoint_interval: u32,
    keep_newest: usize,
    last_checkpoint_iteration: Mutex<HashMap<String, u32>>,
}

/// Filesystem checkpoint store: one JSON file per `(agent_id,
/// sequence)` under `dir`, an automatic-every-N-iterations policy, and a
/// keep-newest-`keep_newest` cleanup sweep run after each write. Cloning
/// shares the same backing directory and interval bookkeeping, so one
/// store can be handed to both a root agent's loop and its children.
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<CheckpointStoreInner>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::from_parts(dir.into(), 5, 5)
    }

    fn from_parts(dir: PathBuf, auto_checkpoint_interval: u32, keep_newest: usize) -> Self {
        Self {
            inner: Arc::new(CheckpointStoreInner {
                dir,
                auto_checkpoint_interval,
                keep_newest,
                last_checkpoint_iteration: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_auto_checkpoint_interval(self, n: u32) -> Self {
        Self::from_parts(self.inner.dir.clone(), n, self.inner.keep_newest)
    }

    pub fn with_keep_newest(self, n: usize) -> Self {
        Self::from_parts(self.inner.dir.clone(), self.inner.auto_checkpoint_interval, n)
    }

    /// Write `state` unconditionally as the next checkpoint for its agent,
    /// then run the keep-newest-N cleanup sweep.
    pub fn save(&self, state: &AgentState) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.inner.dir)
            .map_err(|e| Error::StatePersistence(format!("failed to create checkpoint dir: {e}")))?;
        let sequence = self.next_sequence(&state.agent_id)?;
        let checkpoint = Checkpoint::new(sequence, state.clone());
        let path = self.inner.dir.join(checkpoint.file_name());
        let content = serde_json::to_string_pretty(&checkpoint).map_err(Error::from)?;
        std::fs::write(&path, content)
            .map_err(|e| Error::StatePersistence(format!("failed to write checkpoint: {e}")))?;
        self.cleanup(&state.agent_id)?;
        Ok(path)
    }

    /// Save only if `auto_checkpoint_interval` iterations have passed since
    /// the last checkpoint recorded for this agent.
    pub fn auto_checkpoint(&self, state: &AgentState) -> Result<Option<PathBuf>, Error> {
        let should = {
            let last = self.inner.last_checkpoint_iteration.lock().unwrap();
            let since = state.iteration.saturating_sub(*last.get(&state.agent_id).unwrap_or(&0));
            since >= self.inner.auto_checkpoint_interval
        };
        if !should {
            return Ok(None);
        }
        let path = self.save(state)?;
        self.inner
            .last_checkpoint_iteration
            .lock()
            .unwrap()
            .insert(state.agent_id.clone(), state.iteration);
        Ok(Some(path))
    }

    /// Restore the most recent checkpoint for `agent_id`, if any exist.
    /// An unknown checkpoint version is a `State.Recovery` error rather
    /// than a best-effort load.
    pub fn restore(&self, agent_id: &str) -> Result<Option<AgentState>, Error> {
        let sequences = self.list_sequences(agent_id)?;
        let Some(latest) = sequences.last() else {
            return Ok(None);
        };
        let path = self.inner.dir.join(format!("{agent_id}-{latest:010}.json"));
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::StateRecovery(format!("failed to read checkpoint {}: {e}", path.display())))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(Error::from)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::StateRecovery(format!(
                "unknown checkpoint version {} for agent {agent_id}",
                checkpoint.version
            )));
        }
        Ok(Some(checkpoint.state))
    }

    fn next_sequence(&self, agent_id: &str) -> Result<u64, Error> {
        Ok(self.list_sequences(agent_id)?.last().map(|s| s + 1).unwrap_or(0))
    }

    fn list_sequences(&self, agent_id: &str) -> Result<Vec<u64>, Error> {
        let mut sequences = Vec::new();
        let entries = match std::fs::read_dir(&self.inner.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sequences),
            Err(e) => return Err(Error::StatePersistence(format!("failed to list checkpoint dir: {e}"))),
        };
        let prefix = format!("{agent_id}-");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(prefix.as_str()).and_then(|r| r.strip_suffix(".json")) {
                if let Ok(seq) = rest.parse::<u64>() {
                    sequences.push(seq);
                }
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Keep only the newest `keep_newest` checkpoints for `agent_id`, delete
    /// the rest. Returns the number deleted.
    fn cleanup(&self, agent_id: &str) -> Result<usize, Error> {
        let sequences = self.list_sequences(agent_id)?;
        if sequences.len() <= self.inner.keep_newest {
            return Ok(0);
        }
        let to_delete = sequences.len() - self.inner.keep_newest;
        let mut deleted = 0;
        for seq in &sequences[..to_delete] {
            let path = self.inner.dir.join(format!("{agent_id}-{seq:010}.json"));
            if std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = AgentState::new("Recon", "recon", "scan repo");
        assert_eq!(state.status, AgentStatus::Created);
        state.start();
        assert_eq!(state.status, AgentStatus::Running);
        assert!(state.started_at.is_some());
        state.set_completed(Some(json!({"ok": true})));
        assert_eq!(state.status, AgentStatus::Completed);
        assert!(state.should_stop());
    }

    #[test]
    fn test_max_iterations() {
        let mut state = AgentState::new("a", "specialist", "t");
        state.max_iterations = 10;
        for _ in 0..8 {
            state.increment_iteration();
        }
        assert!(state.is_approaching_max_iterations(0.85));
        assert!(!state.has_reached_max_iterations());
        state.increment_iteration();
        state.increment_iteration();
        assert!(state.has_reached_max_iterations());
        assert!(state.should_stop());
    }

    #[test]
    fn test_waiting_state_roundtrip() {
        let mut state = AgentState::new("a", "orchestrator", "t");
        state.enter_waiting_state("awaiting sub-agent result");
        assert!(state.is_waiting_for_input());
        assert_eq!(state.status, AgentStatus::Waiting);
        state.resume_from_waiting(Some("continue".to_string()));
        assert!(!state.is_waiting_for_input());
        assert_eq!(state.status, AgentStatus::Running);
        assert_eq!(state.task, "continue");
    }

    #[test]
    fn test_waiting_timeout() {
        let mut state = AgentState::new("a", "specialist", "t");
        state.waiting_timeout_seconds = 0;
        state.enter_waiting_state("x");
        state.waiting_start_time = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(state.has_waiting_timeout());
    }

    #[test]
    fn test_add_finding_stamps_provenance() {
        let mut state = AgentState::new("a", "verification", "t");
        state.add_finding(json!({"title": "sqli"}));
        let f = &state.findings[0];
        assert_eq!(f["title"], "sqli");
        assert!(f.get("discovered_at").is_some());
        assert_eq!(f["discovered_by"], state.agent_id);
    }

    #[test]
    fn test_checkpoint_file_name_is_sequence_padded() {
        let state = AgentState::new("a", "recon", "t");
        let agent_id = state.agent_id.clone();
        let checkpoint = Checkpoint::new(3, state);
        assert_eq!(checkpoint.file_name(), format!("{agent_id}-0000000003.json"));
    }

    #[test]
    fn test_should_stop_on_request() {
        let mut state = AgentState::new("a", "recon", "t");
        state.start();
        assert!(!state.should_stop());
        state.request_stop();
        assert_eq!(state.status, AgentStatus::Stopping);
        assert!(state.should_stop());
    }

    #[test]
    fn test_checkpoint_store_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = AgentState::new("a", "recon", "t");
        state.increment_iteration();
        store.save(&state).unwrap();

        let restored = store.restore(&state.agent_id).unwrap().unwrap();
        assert_eq!(restored.agent_id, state.agent_id);
        assert_eq!(restored.iteration, 1);
    }

    #[test]
    fn test_checkpoint_store_restore_missing_agent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.restore("no-such-agent").unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_store_auto_checkpoint_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_auto_checkpoint_interval(3);
        let mut state = AgentState::new("a", "recon", "t");

        state.increment_iteration();
        state.increment_iteration();
        assert!(store.auto_checkpoint(&state).unwrap().is_none());

        state.increment_iteration();
        assert!(store.auto_checkpoint(&state).unwrap().is_some());
        // next checkpoint only fires 3 iterations after this one
        state.increment_iteration();
        assert!(store.auto_checkpoint(&state).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_store_cleanup_keeps_newest_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).with_keep_newest(2);
        let mut state = AgentState::new("a", "recon", "t");
        for _ in 0..5 {
            state.increment_iteration();
            store.save(&state).unwrap();
        }
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_checkpoint_store_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = AgentState::new("a", "recon", "t");
        let mut checkpoint = Checkpoint::new(0, state.clone());
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let path = dir.path().join(checkpoint.file_name());
        std::fs::write(&path, serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let err = store.restore(&state.agent_id).unwrap_err();
        assert!(matches!(err, Error::StateRecovery(_)));
    }
}
