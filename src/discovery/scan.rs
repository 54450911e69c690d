use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::sanitize::sanitize_name;
use crate::git::{self, WorktreeEntry};

/// Name given to every worktree whose HEAD is not on a branch.
pub const DETACHED_NAME: &str = "detached-head";

/// Directories never descended into by [`find_all`].
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "__pycache__",
    "venv",
    "target",
    "dist",
    "build",
];

/// A discovered git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    /// Branch name, or `HEAD` when detached
    pub branch: String,
    /// Path of the first (primary) worktree in the same listing
    pub main_repo: Option<PathBuf>,
    pub is_main: bool,
    pub detached: bool,
    pub locked: bool,
    pub prunable: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Turn a porcelain listing into worktree records.
///
/// The first entry is the primary worktree: its path becomes `main_repo`
/// for every record, and it is named after its directory rather than its
/// branch. Bare entries have no checkout and are skipped.
pub fn worktrees_from_entries(entries: Vec<WorktreeEntry>) -> Vec<Worktree> {
    let now = Utc::now();
    let main_repo = entries.first().map(|e| e.path.clone());

    entries
        .into_iter()
        .enumerate()
        .filter(|(_, entry)| !entry.bare)
        .map(|(idx, entry)| {
            let is_main = idx == 0;
            let dir_name = entry
                .path
                .file_name()
                .map(|n| sanitize_name(&n.to_string_lossy()))
                .unwrap_or_default();

            let (name, branch, detached) = match entry.branch {
                Some(branch) => {
                    let name = if is_main {
                        dir_name.clone()
                    } else {
                        sanitize_name(&branch)
                    };
                    (name, branch, false)
                }
                None => (DETACHED_NAME.to_string(), "HEAD".to_string(), true),
            };

            let name = if !name.is_empty() {
                name
            } else if !dir_name.is_empty() {
                dir_name
            } else {
                "worktree".to_string()
            };

            Worktree {
                name,
                path: entry.path,
                branch,
                main_repo: main_repo.clone(),
                is_main,
                detached: detached || entry.detached,
                locked: entry.locked,
                prunable: entry.prunable,
                discovered_at: now,
            }
        })
        .collect()
}

/// Discover every worktree of the repository at `repo_path`.
pub async fn discover(repo_path: &Path, timeout: Duration) -> Result<Vec<Worktree>> {
    let abs = std::path::absolute(repo_path)
        .with_context(|| format!("Failed to resolve {}", repo_path.display()))?;
    let entries = git::worktree::list_worktrees(&abs, timeout).await?;
    let worktrees = worktrees_from_entries(entries);
    debug!(repo = %abs.display(), count = worktrees.len(), "discovered worktrees");
    Ok(worktrees)
}

/// Directories under `base` that hold git metadata.
///
/// Hidden and dependency directories are skipped, and the walk does not
/// descend into a repository once found.
pub fn find_repo_roots(base: &Path, max_depth: Option<usize>) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(base).follow_links(false);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }

    let mut roots = Vec::new();
    let mut it = walker.into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return false;
        }
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
    });

    while let Some(next) = it.next() {
        let entry = match next {
            Ok(entry) => entry,
            // Unreadable directories are skipped
            Err(_) => continue,
        };
        if git::is_git_repo(entry.path()) {
            roots.push(entry.path().to_path_buf());
            it.skip_current_dir();
        }
    }

    roots
}

/// Discover worktrees of every repository found under `base`.
///
/// Repositories are queried concurrently. A worktree reachable from more
/// than one root (a linked worktree living inside the walk) is reported
/// once, keyed by absolute path.
pub async fn find_all(
    base: &Path,
    max_depth: Option<usize>,
    timeout: Duration,
) -> Result<Vec<Worktree>> {
    let base = std::path::absolute(base)
        .with_context(|| format!("Failed to resolve {}", base.display()))?;
    if !base.is_dir() {
        bail!("{} is not a directory", base.display());
    }

    let walk_base = base.clone();
    let roots = tokio::task::spawn_blocking(move || find_repo_roots(&walk_base, max_depth))
        .await
        .context("Directory walk panicked")?;

    let results = futures::future::join_all(roots.iter().map(|root| discover(root, timeout))).await;

    let mut seen = HashSet::new();
    let mut all = Vec::new();
    for (root, result) in roots.iter().zip(results) {
        match result {
            Ok(worktrees) => {
                for wt in worktrees {
                    if seen.insert(wt.path.clone()) {
                        all.push(wt);
                    }
                }
            }
            Err(e) => debug!(root = %root.display(), error = %e, "skipping repository"),
        }
    }

    info!(base = %base.display(), repos = roots.len(), worktrees = all.len(), "scan complete");
    Ok(all)
}
