use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coding assistants the activity detector knows how to recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Gemini,
    Codex,
}

impl AgentType {
    /// Detection priority. When two agents share a working directory the
    /// earlier entry wins.
    pub const PRIORITY: [AgentType; 3] = [AgentType::Claude, AgentType::Gemini, AgentType::Codex];

    /// Regex matched against a process's program name.
    pub fn signature(&self) -> &'static str {
        match self {
            AgentType::Claude => r"^claude(-code)?$",
            AgentType::Gemini => r"^gemini(-cli)?$",
            AgentType::Codex => r"^codex$",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentType::Claude => "Claude",
            AgentType::Gemini => "Gemini",
            AgentType::Codex => "Codex",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A running coding-assistant process attached to a worktree directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub pid: u32,
    pub path: PathBuf,
    #[serde(default, with = "super::timestamp::optional")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub command: String,
    /// Id of the in-progress task from the project's task store, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_summary: Option<String>,
}

impl AgentInfo {
    pub fn new(agent_type: AgentType, pid: u32, path: PathBuf) -> Self {
        Self {
            agent_type,
            pid,
            path,
            start_time: None,
            command: String::new(),
            active_task: None,
            task_summary: None,
        }
    }

    pub fn has_active_task(&self) -> bool {
        self.active_task.is_some()
    }
}
