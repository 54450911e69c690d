//! The workspace registry.
//!
//! In-process access is serialized by an `RwLock`, and saves by a separate
//! mutex. There is no lock between processes: every save rewrites the whole
//! file, and the last writer wins.

use anyhow::{ensure, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::discovery::{is_valid_name, ActivityDetector, Worktree};
use crate::models::{HealthStatus, ProxyInfo, ServerState, ServerStatus, Workspace};
use crate::persistence;
use crate::process::{LivenessProbe, SystemProbe};

#[derive(Debug, Default)]
struct State {
    workspaces: BTreeMap<String, Workspace>,
    proxy: Option<ProxyInfo>,
}

pub struct Registry {
    path: PathBuf,
    state: RwLock<State>,
    // Held from snapshot to rename so an older snapshot never lands last
    save_lock: Mutex<()>,
}

/// What a cleanup pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Workspaces whose server was marked stopped
    pub stopped: Vec<String>,
    /// Workspaces deleted because their path is gone
    pub removed: Vec<String>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.removed.is_empty()
    }
}

impl Registry {
    /// Load the registry from its default per-user location.
    pub fn load() -> Result<Self> {
        Self::load_from(persistence::default_registry_path()?)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let persisted = persistence::load(&path)?;
        debug!(path = %path.display(), count = persisted.workspaces.len(), "loaded registry");
        Ok(Self {
            path,
            state: RwLock::new(State {
                workspaces: persisted.workspaces,
                proxy: persisted.proxy,
            }),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // A panic while holding the lock leaves plain data behind, still usable
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the whole registry to disk.
    pub fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (workspaces, proxy) = {
            let state = self.read();
            (state.workspaces.clone(), state.proxy.clone())
        };
        persistence::save(&self.path, &workspaces, proxy.as_ref())
    }

    pub fn get(&self, name: &str) -> Option<Workspace> {
        self.read().workspaces.get(name).cloned()
    }

    /// Insert or replace and persist.
    ///
    /// Fails if the name is not made of `[a-z0-9-]`.
    pub fn set(&self, workspace: Workspace) -> Result<()> {
        self.set_without_save(workspace)?;
        self.save()
    }

    /// Insert or replace without touching the file, for batch updates.
    pub fn set_without_save(&self, workspace: Workspace) -> Result<()> {
        ensure!(
            is_valid_name(&workspace.name),
            "invalid workspace name {:?}: use only a-z, 0-9 and '-'",
            workspace.name
        );
        self.write()
            .workspaces
            .insert(workspace.name.clone(), workspace);
        Ok(())
    }

    /// Remove a workspace. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let existed = self.remove_without_save(name);
        self.save()?;
        Ok(existed)
    }

    pub fn remove_without_save(&self, name: &str) -> bool {
        self.write().workspaces.remove(name).is_some()
    }

    /// All workspaces, ordered by name.
    pub fn list(&self) -> Vec<Workspace> {
        self.read().workspaces.values().cloned().collect()
    }

    /// Workspaces whose server is Running or Starting.
    pub fn list_running(&self) -> Vec<Workspace> {
        self.read()
            .workspaces
            .values()
            .filter(|ws| ws.is_running())
            .cloned()
            .collect()
    }

    /// Ports held by active servers.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.read()
            .workspaces
            .values()
            .filter(|ws| ws.is_running())
            .filter_map(Workspace::port)
            .collect()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Workspace> {
        self.read()
            .workspaces
            .values()
            .find(|ws| ws.path == path)
            .cloned()
    }

    pub fn proxy(&self) -> ProxyInfo {
        self.read().proxy.clone().unwrap_or_default()
    }

    pub fn update_proxy(&self, proxy: ProxyInfo) -> Result<()> {
        self.write().proxy = Some(proxy);
        self.save()
    }

    /// Modify a workspace in place and persist.
    ///
    /// Returns `false` without saving if no workspace has that name.
    pub fn update<F>(&self, name: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Workspace),
    {
        {
            let mut state = self.write();
            let Some(ws) = state.workspaces.get_mut(name) else {
                return Ok(false);
            };
            f(ws);
        }
        self.save()?;
        Ok(true)
    }

    /// Attach server state to a workspace.
    pub fn set_server(&self, name: &str, server: ServerState) -> Result<bool> {
        self.update(name, |ws| ws.server = Some(server))
    }

    /// Detach the server, keeping the workspace.
    pub fn clear_server(&self, name: &str) -> Result<bool> {
        self.update(name, |ws| ws.server = None)
    }

    /// Record a health probe result.
    ///
    /// Returns `false` if the workspace is gone or its server is no longer
    /// Running; nothing is written in that case.
    pub fn update_health(&self, name: &str, health: HealthStatus) -> Result<bool> {
        let changed = {
            let mut state = self.write();
            state
                .workspaces
                .get_mut(name)
                .and_then(|ws| ws.server.as_mut())
                .is_some_and(|server| server.record_health(health, Utc::now()))
        };
        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    /// Merge one discovered worktree without saving.
    ///
    /// Git identity is refreshed; server state, tags and activity are kept.
    pub fn upsert_worktree(&self, worktree: &Worktree) {
        let mut state = self.write();
        match state.workspaces.get_mut(&worktree.name) {
            Some(ws) => {
                if ws.path != worktree.path {
                    warn!(
                        name = %worktree.name,
                        old = %ws.path.display(),
                        new = %worktree.path.display(),
                        "workspace name now refers to a different path"
                    );
                }
                ws.path = worktree.path.clone();
                ws.branch = worktree.branch.clone();
                ws.main_repo = worktree.main_repo.clone();
                ws.discovered_at = Some(worktree.discovered_at);
            }
            None => {
                state
                    .workspaces
                    .insert(worktree.name.clone(), Workspace::from_worktree(worktree));
            }
        }
    }

    /// Merge a discovery pass and persist once.
    pub fn merge_worktrees(&self, worktrees: &[Worktree]) -> Result<()> {
        for worktree in worktrees {
            self.upsert_worktree(worktree);
        }
        self.save()
    }

    /// Reconcile recorded state against the OS.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_with(&SystemProbe)
    }

    /// Reconcile using the given probe.
    ///
    /// Per workspace: a missing path deletes it; a recorded pid that is no
    /// longer alive marks the server stopped; a Running server with no pid
    /// whose port nobody listens on is marked stopped too. The file is only
    /// rewritten when something changed.
    pub fn cleanup_with<P: LivenessProbe>(&self, probe: &P) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        {
            let mut state = self.write();
            state.workspaces.retain(|name, ws| {
                if !ws.path.as_os_str().is_empty() && !ws.path.exists() {
                    report.removed.push(name.clone());
                    return false;
                }
                true
            });

            for (name, ws) in state.workspaces.iter_mut() {
                let Some(server) = ws.server.as_mut() else {
                    continue;
                };
                if server.pid > 0 {
                    if !probe.pid_alive(server.pid) {
                        debug!(name = %name, pid = server.pid, "server process is gone");
                        server.mark_stopped();
                        report.stopped.push(name.clone());
                    }
                } else if server.status == ServerStatus::Running
                    && server.port > 0
                    && !probe.port_listening(server.port)
                {
                    debug!(name = %name, port = server.port, "nothing listening on server port");
                    server.mark_stopped();
                    report.stopped.push(name.clone());
                }
            }
        }

        if report.is_empty() {
            return Ok(report);
        }
        info!(
            stopped = report.stopped.len(),
            removed = report.removed.len(),
            "registry cleanup"
        );
        self.save()?;
        Ok(report)
    }

    /// Refresh activity flags for every workspace in one batched pass.
    ///
    /// Workspaces without a checkout on disk (server-only entries carried
    /// over from old files) are left as they are.
    pub async fn update_activities(&self, detector: &ActivityDetector) -> Result<()> {
        let targets: Vec<(String, PathBuf)> = self
            .read()
            .workspaces
            .values()
            .filter(|ws| !ws.path.as_os_str().is_empty() && ws.path.is_dir())
            .map(|ws| (ws.name.clone(), ws.path.clone()))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let paths: Vec<PathBuf> = targets.iter().map(|(_, path)| path.clone()).collect();
        let mut reports = detector.detect_batch(&paths).await;

        {
            let mut state = self.write();
            for (name, path) in &targets {
                let Some(report) = reports.remove(path) else {
                    continue;
                };
                // Removed while detection ran
                let Some(ws) = state.workspaces.get_mut(name) else {
                    continue;
                };
                ws.git_dirty = report.git_dirty;
                ws.has_editor = report.has_editor;
                ws.has_agent = report.has_agent();
                ws.agent = report.agent.clone();
                if report.is_active() {
                    ws.last_activity = Some(report.observed_at);
                }
            }
        }

        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentInfo, AgentType};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProbe {
        alive: HashSet<u32>,
        listening: HashSet<u16>,
    }

    impl LivenessProbe for FakeProbe {
        fn pid_alive(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }

        fn port_listening(&self, port: u16) -> bool {
            self.listening.contains(&port)
        }
    }

    fn workspace(name: &str, path: &Path) -> Workspace {
        let mut ws = Workspace::new(name.to_string(), path.to_path_buf());
        ws.branch = "main".to_string();
        ws
    }

    fn running(port: u16, pid: u32) -> ServerState {
        let mut server = ServerState::starting(
            port,
            format!("http://localhost:{}", port),
            vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
        );
        server.mark_running(pid);
        server
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = Registry::load_from(&file).unwrap();
        assert!(registry.list().is_empty());

        let mut ws = workspace("myapp", dir.path());
        ws.server = Some(running(3926, 4242));
        ws.add_tag("frontend");
        registry.set(ws.clone()).unwrap();
        registry.set(workspace("docs", dir.path())).unwrap();

        let reloaded = Registry::load_from(&file).unwrap();
        assert_eq!(reloaded.list().len(), 2);
        let got = reloaded.get("myapp").unwrap();
        assert_eq!(got.path, ws.path);
        assert_eq!(got.branch, ws.branch);
        assert_eq!(got.server, ws.server);
        assert!(got.has_tag("frontend"));
    }

    #[test]
    fn test_corrupt_file_fails_load() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        std::fs::write(&file, "not json at all").unwrap();
        assert!(Registry::load_from(&file).is_err());
        // Left for the user to fix
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "not json at all");
    }

    #[test]
    fn test_set_rejects_invalid_names() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = Registry::load_from(&file).unwrap();

        for name in ["Foo.Bar", "", "feature/auth", "my app"] {
            let err = registry.set(workspace(name, dir.path())).unwrap_err();
            assert!(err.to_string().contains("invalid workspace name"), "{}", name);
            assert!(registry.set_without_save(workspace(name, dir.path())).is_err());
        }
        assert!(registry.list().is_empty());
        assert!(!file.exists());

        registry.set(workspace("feature-auth-2", dir.path())).unwrap();
        assert!(registry.get("feature-auth-2").is_some());
    }

    #[test]
    fn test_independent_writers_never_tear_the_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");

        // One registry per round, like separate processes sharing the file
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let file = file.clone();
                let root = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    for round in 0..100 {
                        let registry = Registry::load_from(&file).unwrap();
                        let mut ws = workspace(&format!("writer-{}", i), &root);
                        ws.add_tag(&format!("round-{}", round));
                        registry.set(ws).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let registry = Registry::load_from(&file).unwrap();
        assert!(!registry.list().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("registry.json")]);
    }

    #[test]
    fn test_shared_registry_saves_latest_state() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = std::sync::Arc::new(Registry::load_from(&file).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let registry = std::sync::Arc::clone(&registry);
                let root = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let mut ws = workspace(&format!("writer-{}", i), &root);
                        ws.add_tag(&format!("round-{}", round));
                        registry.set(ws).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let on_disk = Registry::load_from(&file).unwrap();
        assert_eq!(on_disk.list().len(), 4);
        for ws in registry.list() {
            assert_eq!(on_disk.get(&ws.name).unwrap().tags, ws.tags);
        }
    }

    #[test]
    fn test_running_and_used_ports() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load_from(dir.path().join("r.json")).unwrap();

        let mut up = workspace("up", dir.path());
        up.server = Some(running(3001, 10));
        let mut starting = workspace("starting", dir.path());
        starting.server = Some(ServerState::starting(3002, String::new(), Vec::new()));
        let mut stopped = workspace("stopped", dir.path());
        let mut server = running(3003, 11);
        server.mark_stopped();
        stopped.server = Some(server);

        for ws in [up, starting, stopped, workspace("idle", dir.path())] {
            registry.set_without_save(ws).unwrap();
        }

        let names: Vec<String> = registry.list_running().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["starting".to_string(), "up".to_string()]);
        assert_eq!(registry.used_ports(), HashSet::from([3001, 3002]));
    }

    #[test]
    fn test_cleanup_stale_pid() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = Registry::load_from(&file).unwrap();
        let mut ws = workspace("stale", dir.path());
        ws.server = Some(running(3500, 999_999_999));
        registry.set(ws).unwrap();

        let report = registry.cleanup().unwrap();
        assert_eq!(report.stopped, vec!["stale".to_string()]);
        assert!(report.removed.is_empty());

        let server = registry.get("stale").unwrap().server.unwrap();
        assert_eq!(server.status, ServerStatus::Stopped);
        assert_eq!(server.pid, 0);

        // Persisted
        let reloaded = Registry::load_from(&file).unwrap();
        assert_eq!(
            reloaded.get("stale").unwrap().server.unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[test]
    fn test_cleanup_rules() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = Registry::load_from(&file).unwrap();

        registry.set_without_save(workspace("gone", &dir.path().join("deleted"))).unwrap();
        let mut alive = workspace("alive", dir.path());
        alive.server = Some(running(3001, 100));
        let mut orphan = workspace("orphan", dir.path());
        orphan.server = Some(running(3002, 0));
        let mut attached = workspace("attached", dir.path());
        attached.server = Some(running(3003, 0));
        for ws in [alive, orphan, attached] {
            registry.set_without_save(ws).unwrap();
        }

        let probe = FakeProbe {
            alive: HashSet::from([100]),
            listening: HashSet::from([3003]),
        };
        let report = registry.cleanup_with(&probe).unwrap();
        assert_eq!(report.removed, vec!["gone".to_string()]);
        assert_eq!(report.stopped, vec!["orphan".to_string()]);

        assert!(registry.get("gone").is_none());
        assert!(registry.get("alive").unwrap().is_running());
        assert!(registry.get("attached").unwrap().is_running());
        assert!(!registry.get("orphan").unwrap().is_running());
        assert!(file.exists());
    }

    #[test]
    fn test_cleanup_without_changes_does_not_write() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("registry.json");
        let registry = Registry::load_from(&file).unwrap();
        registry.set_without_save(workspace("idle", dir.path())).unwrap();

        let report = registry.cleanup_with(&FakeProbe::default()).unwrap();
        assert!(report.is_empty());
        assert!(!file.exists());
    }

    #[test]
    fn test_update_and_health() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load_from(dir.path().join("r.json")).unwrap();
        registry.set(workspace("web", dir.path())).unwrap();

        assert!(!registry.update("missing", |ws| ws.git_dirty = true).unwrap());
        assert!(!registry.update_health("web", HealthStatus::Healthy).unwrap());

        registry.set_server("web", running(3100, 1)).unwrap();
        assert!(registry.update_health("web", HealthStatus::Unhealthy).unwrap());
        let server = registry.get("web").unwrap().server.unwrap();
        assert_eq!(server.health, HealthStatus::Unhealthy);
        assert!(server.last_health_check.is_some());

        assert!(!registry.update_health("missing", HealthStatus::Healthy).unwrap());

        registry.clear_server("web").unwrap();
        let ws = registry.get("web").unwrap();
        assert!(ws.server.is_none());
        assert_eq!(registry.find_by_path(dir.path()).map(|w| w.name), Some("web".to_string()));
    }

    #[test]
    fn test_merge_preserves_server_state() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load_from(dir.path().join("r.json")).unwrap();

        let mut ws = workspace("feature-auth", dir.path());
        ws.server = Some(running(3846, 55));
        ws.add_tag("api");
        let created = ws.created_at;
        registry.set_without_save(ws).unwrap();

        let moved = dir.path().join("moved");
        let worktrees = vec![
            Worktree {
                name: "feature-auth".to_string(),
                path: moved.clone(),
                branch: "feature/auth".to_string(),
                main_repo: Some(dir.path().to_path_buf()),
                is_main: false,
                detached: false,
                locked: false,
                prunable: false,
                discovered_at: Utc::now(),
            },
            Worktree {
                name: "myapp".to_string(),
                path: dir.path().to_path_buf(),
                branch: "main".to_string(),
                main_repo: Some(dir.path().to_path_buf()),
                is_main: true,
                detached: false,
                locked: false,
                prunable: false,
                discovered_at: Utc::now(),
            },
        ];
        registry.merge_worktrees(&worktrees).unwrap();

        let merged = registry.get("feature-auth").unwrap();
        assert_eq!(merged.path, moved);
        assert_eq!(merged.branch, "feature/auth");
        assert_eq!(merged.port(), Some(3846));
        assert!(merged.has_tag("api"));
        assert_eq!(merged.created_at, created);
        assert!(registry.get("myapp").unwrap().is_main());
    }

    #[test]
    fn test_proxy_defaults_and_persists() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("r.json");
        let registry = Registry::load_from(&file).unwrap();
        assert!(!registry.proxy().is_running());

        registry
            .update_proxy(ProxyInfo {
                pid: 77,
                started_at: Some(Utc::now()),
                http_port: 80,
                https_port: 443,
            })
            .unwrap();
        let reloaded = Registry::load_from(&file).unwrap();
        assert_eq!(reloaded.proxy().pid, 77);
    }

    #[tokio::test]
    async fn test_update_activities_sets_flags() {
        let dir = TempDir::new().unwrap();
        let editor_state = dir.path().join("remote");
        std::fs::create_dir_all(editor_state.join(".vscode-server")).unwrap();

        let registry = Registry::load_from(dir.path().join("r.json")).unwrap();
        let mut ws = workspace("remote", &editor_state);
        ws.agent = Some(AgentInfo::new(AgentType::Claude, 1, editor_state.clone()));
        ws.has_agent = true;
        registry.set_without_save(ws).unwrap();

        let detector = ActivityDetector::new(std::time::Duration::from_secs(5)).unwrap();
        registry.update_activities(&detector).await.unwrap();

        let ws = registry.get("remote").unwrap();
        assert!(ws.has_editor);
        assert!(ws.last_activity.is_some());
        // Recorded agent is replaced by what the scan saw
        assert_eq!(ws.has_agent, ws.agent.is_some());
        assert_ne!(ws.agent.map(|a| a.pid), Some(1));
    }

    #[tokio::test]
    async fn test_update_activities_skips_pathless_workspaces() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load_from(dir.path().join("r.json")).unwrap();

        // Server-only entry carried over from an old file
        let mut orphan = Workspace::new("orphan".to_string(), PathBuf::new());
        orphan.server = Some(running(3200, 0));
        orphan.git_dirty = true;
        orphan.has_editor = true;
        registry.set_without_save(orphan).unwrap();
        registry.set_without_save(workspace("real", dir.path())).unwrap();

        let detector = ActivityDetector::new(std::time::Duration::from_secs(5)).unwrap();
        registry.update_activities(&detector).await.unwrap();

        let orphan = registry.get("orphan").unwrap();
        assert!(orphan.git_dirty);
        assert!(orphan.has_editor);
        assert!(orphan.agent.is_none());
        assert!(!orphan.has_agent);
        assert!(orphan.last_activity.is_none());
    }
}
