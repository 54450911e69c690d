use super::agent::{AgentInfo, AgentType};
use super::server::ServerState;
use crate::discovery::Worktree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One worktree together with its optional dev server.
///
/// `name` is the registry key. It doubles as the subdomain label and the
/// port allocator's hash key, so it only ever holds `[a-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub branch: String,
    /// Primary worktree of the repository this checkout belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo: Option<PathBuf>,
    #[serde(default)]
    pub git_dirty: bool,
    #[serde(default, alias = "has_claude")]
    pub has_agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentInfo>,
    #[serde(default, alias = "has_vscode")]
    pub has_editor: bool,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_activity: Option<DateTime<Utc>>,
    /// `None` means no server has been started or attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub discovered_at: Option<DateTime<Utc>>,
}

impl Workspace {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            branch: String::new(),
            main_repo: None,
            git_dirty: false,
            has_agent: false,
            agent: None,
            has_editor: false,
            last_activity: None,
            server: None,
            tags: Vec::new(),
            created_at: Some(Utc::now()),
            discovered_at: None,
        }
    }

    pub fn from_worktree(worktree: &Worktree) -> Self {
        let mut ws = Self::new(worktree.name.clone(), worktree.path.clone());
        ws.branch = worktree.branch.clone();
        ws.main_repo = worktree.main_repo.clone();
        ws.discovered_at = Some(worktree.discovered_at);
        ws
    }

    /// True while the server is Running or Starting.
    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(ServerState::is_active)
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.server.as_ref().map(|s| s.port)
    }

    pub fn url(&self) -> Option<&str> {
        self.server
            .as_ref()
            .map(|s| s.url.as_str())
            .filter(|url| !url.is_empty())
    }

    pub fn agent_type(&self) -> Option<AgentType> {
        self.agent.as_ref().map(|a| a.agent_type)
    }

    /// Is the worktree the primary checkout of its repository
    pub fn is_main(&self) -> bool {
        self.main_repo.as_ref().is_some_and(|main| *main == self.path)
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.server.as_ref().and_then(ServerState::uptime)
    }

    pub fn uptime_display(&self) -> String {
        let Some(uptime) = self.uptime() else {
            return "-".to_string();
        };
        let hours = uptime.num_hours();
        let minutes = uptime.num_minutes() % 60;
        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m", minutes)
        } else {
            format!("{}s", uptime.num_seconds().max(0))
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Returns false if the tag was already present
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.has_tag(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        self.tags.len() != before
    }

    pub fn display_path(&self) -> String {
        let full = self.path.display().to_string();
        if let Some(home) = dirs::home_dir() {
            let home = home.display().to_string();
            if let Some(rest) = full.strip_prefix(&home) {
                return format!("~{}", rest);
            }
        }
        full
    }
}
