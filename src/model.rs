use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Identifier of a script in the remote catalog.
pub type ScriptId = u32;

/// Per-script log history for one user, as served by the log store.
pub type ScriptLogs = BTreeMap<ScriptId, Vec<LogEntry>>;

/// Username -> per-script history. Built only in team analytics mode.
pub type TeamLogSet = BTreeMap<String, ScriptLogs>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub history_hours: u32,
    pub team_roster: Vec<String>,
    pub state_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Number,
    Dropdown,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InputKind::Text => "text",
            InputKind::Number => "number",
            InputKind::Dropdown => "dropdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub inputs: Vec<InputConfig>,
}

/// The catalog occasionally serves a lone input object instead of a list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<InputConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<InputConfig>),
        One(InputConfig),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(i)) => vec![i],
        Some(OneOrMany::Many(v)) => v,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, alias = "scriptCount")]
    pub script_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl FileDescriptor {
    /// Path used for downloads; the service accepts the bare name when no path was reported.
    pub fn download_path(&self) -> &str {
        if self.path.is_empty() {
            &self.name
        } else {
            &self.path
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Warning,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Warning => "warning",
        }
    }
}

/// Immutable record of one completed (or failed/stopped) run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub status: LogStatus,
    pub message: String,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// How a run left the `Running` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Running,
    Completed(RunOutcome),
    Stopped,
    /// No response arrived within the run timeout; the remote outcome is unknown.
    TimedOut,
}

/// Ephemeral per-script run state. Never persisted.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: RunPhase,
    pub current_output: String,
    pub current_files: Vec<FileDescriptor>,
    pub has_table_output: bool,
    pub inputs: HashMap<String, String>,
    pub parsed: Option<crate::parser::ParsedOutput>,
    /// Bumped on every accepted run request; completions carrying an older value are stale.
    pub generation: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            current_output: String::new(),
            current_files: Vec::new(),
            has_table_output: false,
            inputs: HashMap::new(),
            parsed: None,
            generation: 0,
        }
    }
}

impl RunState {
    pub fn is_running(&self) -> bool {
        self.phase == RunPhase::Running
    }
}

/// Events emitted by the engine and consumed by presentation layers.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    RunStarted {
        script_id: ScriptId,
        generation: u64,
    },
    RunFinished {
        script_id: ScriptId,
        phase: RunPhase,
        // Boxed to keep the enum small.
        entry: Box<LogEntry>,
    },
    RunStopped {
        script_id: ScriptId,
    },
    StaleResponse {
        script_id: ScriptId,
        generation: u64,
    },
    FilesUpdated {
        script_id: ScriptId,
        count: usize,
    },
    Info(InfoEvent),
}

/// Structured info events emitted by the engine and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    LogPersistFailed { script_id: ScriptId, error: String },
    StopRequestFailed { script_id: ScriptId, error: String },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::LogPersistFailed { script_id, error } => {
                format!("Could not save log for script {}: {}", script_id, error)
            }
            InfoEvent::StopRequestFailed { script_id, error } => {
                format!("Stop request for script {} failed: {}", script_id, error)
            }
        }
    }
}
