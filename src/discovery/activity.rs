//! Batched activity detection.
//!
//! A refresh costs one process-table scan, one `lsof` call for every
//! candidate agent, and one `git status` per worktree issued concurrently.
//! Nothing is spawned per worktree for agent or editor detection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::procs::{self, ProcessEntry, ProcessTable};
use super::tasks;
use crate::git;
use crate::models::{AgentInfo, AgentType};

/// Editor binaries, matched against program basenames.
const EDITOR_PROGRAMS: &str = r"(?i)^(code|code-insiders|codium|cursor|zed|windsurf)$";
/// macOS app bundles, matched against the full command line.
const EDITOR_BUNDLES: &str = r"(?i)/(visual studio code|cursor|zed|windsurf)[^/]*\.app/";
/// Remote-editor state a VS Code server leaves in a checkout.
const VSCODE_SERVER_DIR: &str = ".vscode-server";

/// What was observed in one worktree.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityReport {
    pub git_dirty: bool,
    pub agent: Option<AgentInfo>,
    pub has_editor: bool,
    pub observed_at: DateTime<Utc>,
}

impl ActivityReport {
    fn idle(observed_at: DateTime<Utc>) -> Self {
        Self {
            git_dirty: false,
            agent: None,
            has_editor: false,
            observed_at,
        }
    }

    pub fn has_agent(&self) -> bool {
        self.agent.is_some()
    }

    /// Anything at all going on in the worktree.
    pub fn is_active(&self) -> bool {
        self.git_dirty || self.has_editor || self.agent.is_some()
    }
}

pub struct ActivityDetector {
    timeout: Duration,
    signatures: Vec<(AgentType, Regex)>,
    editor_programs: Regex,
    editor_bundles: Regex,
}

impl ActivityDetector {
    /// `timeout` bounds each external command the detector runs.
    pub fn new(timeout: Duration) -> Result<Self> {
        let signatures = AgentType::PRIORITY
            .iter()
            .map(|agent_type| {
                Regex::new(agent_type.signature())
                    .map(|re| (*agent_type, re))
                    .with_context(|| format!("Invalid signature for {}", agent_type))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            timeout,
            signatures,
            editor_programs: Regex::new(EDITOR_PROGRAMS).context("Invalid editor pattern")?,
            editor_bundles: Regex::new(EDITOR_BUNDLES).context("Invalid editor pattern")?,
        })
    }

    /// Agents found in the table, one per working directory.
    ///
    /// The returned list is in agent priority order.
    pub async fn detect_agents(&self, table: &ProcessTable) -> Vec<AgentInfo> {
        let candidates: Vec<(AgentType, &ProcessEntry)> = self
            .signatures
            .iter()
            .flat_map(|(agent_type, re)| table.matching(re).map(move |p| (*agent_type, p)))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut pids: Vec<u32> = candidates.iter().map(|(_, p)| p.pid).collect();
        pids.sort_unstable();
        pids.dedup();

        let cwds = procs::resolve_cwds(&pids, self.timeout).await;
        debug!(candidates = pids.len(), resolved = cwds.len(), "resolved agent directories");
        agents_by_directory(&candidates, &cwds)
    }

    /// Directories that running editors have open.
    pub fn editor_directories(&self, table: &ProcessTable) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = table
            .entries()
            .iter()
            .filter(|p| self.is_editor(p))
            .flat_map(|p| p.path_args())
            .filter(|path| path.is_dir())
            .map(canonical)
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    fn is_editor(&self, entry: &ProcessEntry) -> bool {
        entry.runs(&self.editor_programs) || self.editor_bundles.is_match(&entry.command)
    }

    /// Detect activity for every path in one batched pass.
    ///
    /// The result has an entry for every input path. An empty path is
    /// reported idle.
    pub async fn detect_batch(&self, paths: &[PathBuf]) -> HashMap<PathBuf, ActivityReport> {
        if paths.is_empty() {
            return HashMap::new();
        }

        let (table, dirty) = tokio::join!(
            ProcessTable::snapshot(self.timeout),
            dirty_states(paths, self.timeout)
        );
        let agents = self.detect_agents(&table).await;
        let editor_dirs = self.editor_directories(&table);

        let observed_at = Utc::now();
        let resolved: Vec<(PathBuf, PathBuf)> = paths
            .iter()
            .map(|p| (p.clone(), canonical(p)))
            .collect();
        let canonical_paths: Vec<PathBuf> = resolved.iter().map(|(_, c)| c.clone()).collect();
        let mut attached = attach_agents(&agents, &canonical_paths);

        let mut reports = HashMap::with_capacity(paths.len());
        for (path, canon) in resolved {
            let mut report = ActivityReport::idle(observed_at);
            if path.as_os_str().is_empty() {
                reports.insert(path, report);
                continue;
            }
            report.git_dirty = dirty.get(&path).copied().unwrap_or(false);
            report.has_editor = path.join(VSCODE_SERVER_DIR).is_dir()
                || editor_dirs.iter().any(|dir| editor_covers(dir, &canon));

            if let Some(mut agent) = attached.remove(&canon) {
                enrich_with_task(&mut agent, &path);
                report.agent = Some(agent);
            }
            reports.insert(path, report);
        }

        debug!(
            worktrees = paths.len(),
            agents = agents.len(),
            editors = editor_dirs.len(),
            "activity refresh complete"
        );
        reports
    }

    /// Detect activity for a single worktree.
    pub async fn detect(&self, path: &Path) -> ActivityReport {
        let path = path.to_path_buf();
        self.detect_batch(std::slice::from_ref(&path))
            .await
            .remove(&path)
            .unwrap_or_else(|| ActivityReport::idle(Utc::now()))
    }
}

/// Run `git status` in every path at once and collect results as they land.
async fn dirty_states(paths: &[PathBuf], timeout: Duration) -> HashMap<PathBuf, bool> {
    let mut pending: FuturesUnordered<_> = paths
        .iter()
        .filter(|path| !path.as_os_str().is_empty())
        .map(|path| async move { (path.clone(), git::worktree::is_dirty(path, timeout).await) })
        .collect();

    let mut states = HashMap::with_capacity(paths.len());
    while let Some((path, dirty)) = pending.next().await {
        states.insert(path, dirty);
    }
    states
}

/// One agent per working directory, first candidate wins.
fn agents_by_directory(
    candidates: &[(AgentType, &ProcessEntry)],
    cwds: &HashMap<u32, PathBuf>,
) -> Vec<AgentInfo> {
    let mut agents: Vec<AgentInfo> = Vec::new();
    for (agent_type, entry) in candidates {
        let Some(cwd) = cwds.get(&entry.pid) else {
            continue;
        };
        if agents.iter().any(|a| a.path == *cwd) {
            continue;
        }
        let mut agent = AgentInfo::new(*agent_type, entry.pid, cwd.clone());
        agent.start_time = entry.start_time;
        agent.command = entry.command.clone();
        agents.push(agent);
    }
    agents
}

/// Map each agent to the deepest worktree containing its directory.
///
/// Agents arrive in priority order, so the first one claiming a worktree keeps it.
fn attach_agents(agents: &[AgentInfo], worktrees: &[PathBuf]) -> HashMap<PathBuf, AgentInfo> {
    let mut attached = HashMap::new();
    for agent in agents {
        let owner = worktrees
            .iter()
            .filter(|wt| !wt.as_os_str().is_empty() && agent.path.starts_with(wt))
            .max_by_key(|wt| wt.components().count());
        if let Some(owner) = owner {
            attached
                .entry(owner.clone())
                .or_insert_with(|| agent.clone());
        }
    }
    attached
}

/// An editor open on the worktree or on a directory inside it.
fn editor_covers(editor_dir: &Path, worktree: &Path) -> bool {
    !worktree.as_os_str().is_empty() && editor_dir.starts_with(worktree)
}

fn enrich_with_task(agent: &mut AgentInfo, worktree: &Path) {
    if let Some(task) = tasks::active_task(worktree) {
        agent.active_task = Some(task.id);
        agent.task_summary = Some(task.description).filter(|d| !d.is_empty());
    }
}

/// Process cwds come back with symlinks resolved.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(pid: u32, command: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            start_time: None,
            command: command.to_string(),
        }
    }

    #[test]
    fn test_first_agent_wins_per_directory() {
        let claude = entry(10, "claude");
        let gemini = entry(11, "gemini");
        let other_gemini = entry(12, "gemini-cli");
        let candidates = vec![
            (AgentType::Claude, &claude),
            (AgentType::Gemini, &gemini),
            (AgentType::Gemini, &other_gemini),
        ];
        let cwds = HashMap::from([
            (10, PathBuf::from("/code/app")),
            (11, PathBuf::from("/code/app")),
            (12, PathBuf::from("/code/app-feature")),
        ]);

        let agents = agents_by_directory(&candidates, &cwds);
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].agent_type, AgentType::Claude);
        assert_eq!(agents[0].pid, 10);
        assert_eq!(agents[1].pid, 12);
        assert_eq!(agents[1].command, "gemini-cli");
    }

    #[test]
    fn test_unresolved_pids_are_dropped() {
        let codex = entry(20, "codex");
        let agents = agents_by_directory(&[(AgentType::Codex, &codex)], &HashMap::new());
        assert!(agents.is_empty());
    }

    #[test]
    fn test_attach_to_deepest_worktree() {
        let agents = vec![
            AgentInfo::new(AgentType::Claude, 1, PathBuf::from("/code/app/nested/src")),
            AgentInfo::new(AgentType::Gemini, 2, PathBuf::from("/code/app/lib")),
            AgentInfo::new(AgentType::Codex, 3, PathBuf::from("/elsewhere")),
        ];
        let worktrees = vec![PathBuf::from("/code/app"), PathBuf::from("/code/app/nested")];

        let attached = attach_agents(&agents, &worktrees);
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[Path::new("/code/app/nested")].pid, 1);
        assert_eq!(attached[Path::new("/code/app")].pid, 2);
    }

    #[test]
    fn test_attach_skips_empty_worktree_path() {
        let agents = vec![AgentInfo::new(AgentType::Claude, 1, PathBuf::from("/elsewhere"))];
        let attached = attach_agents(&agents, &[PathBuf::new(), PathBuf::from("/code/app")]);
        assert!(attached.is_empty());
    }

    #[test]
    fn test_attach_ignores_sibling_prefix() {
        let agents = vec![AgentInfo::new(
            AgentType::Claude,
            1,
            PathBuf::from("/code/app-feature"),
        )];
        let attached = attach_agents(&agents, &[PathBuf::from("/code/app")]);
        assert!(attached.is_empty());
    }

    #[test]
    fn test_editor_directories() {
        let dir = TempDir::new().unwrap();
        let open = dir.path().display().to_string();
        let table = ProcessTable::parse(&format!(
            "100 Mon Jan  1 09:00:00 2024 /usr/share/code/code {open}\n\
             101 Mon Jan  1 09:00:00 2024 vim {open}\n\
             102 Mon Jan  1 09:00:00 2024 cursor /does/not/exist\n"
        ));

        let detector = ActivityDetector::new(Duration::from_secs(1)).unwrap();
        assert_eq!(
            detector.editor_directories(&table),
            vec![dir.path().canonicalize().unwrap()]
        );
    }

    #[test]
    fn test_editor_covers() {
        assert!(editor_covers(Path::new("/code/app"), Path::new("/code/app")));
        assert!(editor_covers(Path::new("/code/app/src"), Path::new("/code/app")));
        assert!(!editor_covers(Path::new("/code/app"), Path::new("/code/app-feature")));
        // An editor on a parent directory does not claim every checkout below it
        assert!(!editor_covers(Path::new("/code"), Path::new("/code/app")));
        assert!(!editor_covers(Path::new("/code/app"), Path::new("")));
    }

    #[test]
    fn test_task_enrichment() {
        let dir = TempDir::new().unwrap();
        let tasks_dir = dir.path().join(tasks::TASK_DIR_NAME).join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        std::fs::write(
            tasks_dir.join("a.json"),
            r#"{"id":"a","status":"in_progress","description":"Wire up auth"}"#,
        )
        .unwrap();

        let mut agent = AgentInfo::new(AgentType::Claude, 1, dir.path().to_path_buf());
        enrich_with_task(&mut agent, dir.path());
        assert_eq!(agent.active_task.as_deref(), Some("a"));
        assert_eq!(agent.task_summary.as_deref(), Some("Wire up auth"));
    }

    #[tokio::test]
    async fn test_detect_batch_reports_every_path() {
        let plain = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::create_dir(remote.path().join(VSCODE_SERVER_DIR)).unwrap();

        let detector = ActivityDetector::new(Duration::from_secs(5)).unwrap();
        let paths = vec![plain.path().to_path_buf(), remote.path().to_path_buf()];
        let reports = detector.detect_batch(&paths).await;

        assert_eq!(reports.len(), 2);
        // Not git checkouts, so status fails and reads as clean
        assert!(!reports[&paths[0]].git_dirty);
        assert!(reports[&paths[1]].has_editor);
        assert!(detector.detect_batch(&[]).await.is_empty());

        let empty = PathBuf::new();
        let reports = detector.detect_batch(std::slice::from_ref(&empty)).await;
        assert_eq!(reports[&empty], ActivityReport::idle(reports[&empty].observed_at));
    }
}
