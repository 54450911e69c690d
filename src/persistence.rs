//! On-disk format of the registry file.
//!
//! Current files hold a single `workspaces` map. Older files kept servers
//! and worktrees in two separate maps; those are folded into workspaces
//! on load and never written back.

use crate::models::{
    AgentInfo, HealthStatus, ProxyInfo, ServerState, ServerStatus, Workspace,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const FORMAT_VERSION: u32 = 2;

/// Registry file contents as read from disk.
#[derive(Debug, Default, Deserialize)]
pub struct PersistedRegistry {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub workspaces: BTreeMap<String, Workspace>,
    #[serde(default)]
    pub proxy: Option<ProxyInfo>,
    #[serde(default)]
    servers: BTreeMap<String, LegacyServer>,
    #[serde(default)]
    worktrees: BTreeMap<String, LegacyWorktree>,
}

/// Server record from the two-map format.
#[derive(Debug, Default, Deserialize)]
struct LegacyServer {
    #[serde(default)]
    port: u16,
    #[serde(default)]
    pid: u32,
    // Older writers emit `null` for an empty command
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    path: PathBuf,
    #[serde(default)]
    url: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    health: String,
    #[serde(default, with = "crate::models::timestamp::optional")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::optional")]
    stopped_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::optional")]
    last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Worktree record from the two-map format.
#[derive(Debug, Default, Deserialize)]
struct LegacyWorktree {
    #[serde(default)]
    path: PathBuf,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    main_repo: Option<PathBuf>,
    #[serde(default, with = "crate::models::timestamp::optional")]
    discovered_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::optional")]
    last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    has_claude: bool,
    #[serde(default)]
    has_gemini: bool,
    #[serde(default)]
    has_vscode: bool,
    #[serde(default)]
    git_dirty: bool,
    #[serde(default)]
    agent: Option<AgentInfo>,
}

impl LegacyServer {
    /// A server entry only carries state if something was ever recorded.
    fn server_state(&self) -> Option<ServerState> {
        if self.port == 0 && self.pid == 0 && self.status.is_empty() {
            return None;
        }
        // Unrecognised statuses read as stopped rather than failing the load
        let status = self.status.parse().unwrap_or(ServerStatus::Stopped);
        Some(ServerState {
            port: self.port,
            pid: self.pid,
            status,
            health: self.health.parse().unwrap_or(HealthStatus::Unknown),
            url: self.url.clone(),
            command: self.command.clone().unwrap_or_default(),
            log_file: self.log_file.clone().filter(|p| !p.as_os_str().is_empty()),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            last_health_check: self.last_health_check,
        })
    }

    fn into_workspace(self, name: &str) -> Workspace {
        let mut ws = Workspace::new(name.to_string(), self.path.clone());
        ws.branch = self.branch.clone();
        ws.tags = self.tags.clone().unwrap_or_default();
        ws.created_at = self.started_at;
        ws.server = self.server_state();
        ws
    }
}

impl LegacyWorktree {
    fn apply_to(self, ws: &mut Workspace) {
        if ws.path.as_os_str().is_empty() {
            ws.path = self.path;
        }
        if ws.branch.is_empty() {
            ws.branch = self.branch;
        }
        ws.main_repo = self.main_repo.filter(|p| !p.as_os_str().is_empty());
        ws.git_dirty = self.git_dirty;
        ws.has_agent = self.has_claude || self.has_gemini || self.agent.is_some();
        ws.agent = self.agent;
        ws.has_editor = self.has_vscode;
        ws.last_activity = self.last_activity;
        ws.discovered_at = self.discovered_at;
    }
}

impl PersistedRegistry {
    pub fn is_legacy(&self) -> bool {
        !self.servers.is_empty() || !self.worktrees.is_empty()
    }

    /// Fold the legacy maps into `workspaces`.
    ///
    /// Server fields come from the server map, git and activity fields from
    /// the worktree map. A name already present in `workspaces` keeps its
    /// unified entry.
    fn migrate(&mut self) -> usize {
        let servers = std::mem::take(&mut self.servers);
        let worktrees = std::mem::take(&mut self.worktrees);

        let mut merged: BTreeMap<String, Workspace> = servers
            .into_iter()
            .map(|(name, server)| {
                let ws = server.into_workspace(&name);
                (name, ws)
            })
            .collect();

        for (name, worktree) in worktrees {
            let ws = merged
                .entry(name.clone())
                .or_insert_with(|| Workspace::new(name, PathBuf::new()));
            worktree.apply_to(ws);
        }

        let mut migrated = 0;
        for (name, ws) in merged {
            if self.workspaces.contains_key(&name) {
                continue;
            }
            self.workspaces.insert(name, ws);
            migrated += 1;
        }
        migrated
    }
}

pub fn default_registry_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
        .join("grove");
    Ok(config_dir.join("registry.json"))
}

/// Read the registry file. A missing file is an empty registry.
pub fn load(path: &Path) -> Result<PersistedRegistry> {
    if !path.exists() {
        return Ok(PersistedRegistry::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry {}", path.display()))?;
    let mut state: PersistedRegistry = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse registry {}", path.display()))?;

    if state.is_legacy() {
        let migrated = state.migrate();
        info!(path = %path.display(), migrated, "migrated legacy registry format");
    }

    // Keys are authoritative
    for (name, ws) in state.workspaces.iter_mut() {
        if ws.name != *name {
            warn!(key = %name, stored = %ws.name, "workspace name differs from its key");
            ws.name = name.clone();
        }
    }

    Ok(state)
}

/// Rewrite the whole registry file.
///
/// The legacy maps are never written.
pub fn save(
    path: &Path,
    workspaces: &BTreeMap<String, Workspace>,
    proxy: Option<&ProxyInfo>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create registry directory {}", dir.display()))?;
    }

    #[derive(Serialize)]
    struct Out<'a> {
        version: u32,
        workspaces: &'a BTreeMap<String, Workspace>,
        #[serde(skip_serializing_if = "Option::is_none")]
        proxy: Option<&'a ProxyInfo>,
    }

    let contents = serde_json::to_string_pretty(&Out {
        version: FORMAT_VERSION,
        workspaces,
        proxy,
    })
    .context("Failed to serialize registry")?;

    // One temp file per writer; the rename publishes a complete file
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write registry {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace registry {}", path.display()))?;

    Ok(())
}
