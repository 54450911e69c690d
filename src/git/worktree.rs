//! Git worktree queries.
//!
//! Only git's scripting output (`worktree list --porcelain`,
//! `status --porcelain`, `rev-parse`) is relied on, never the on-disk
//! layout of `.git` beyond the `gitdir:` pointer of a linked worktree.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::{self, CommandError};

/// Check if a path is a git checkout (primary `.git` dir or linked `.git` file)
pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// One record of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Branch name with `refs/heads/` stripped
    pub branch: Option<String>,
    pub detached: bool,
    pub bare: bool,
    pub locked: bool,
    pub prunable: bool,
}

/// Parse `git worktree list --porcelain` output.
///
/// Records start at a `worktree <path>` line; attribute lines that appear
/// before the first record are ignored.
pub fn parse_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                ..WorktreeEntry::default()
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(branch.to_string());
        } else if line == "detached" {
            entry.detached = true;
        } else if line == "bare" {
            entry.bare = true;
        } else if line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        } else if line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
    }

    // Don't forget the last worktree
    if let Some(entry) = current {
        entries.push(entry);
    }

    entries
}

/// List all worktrees of the repository containing `repo_path`.
pub async fn list_worktrees(repo_path: &Path, timeout: Duration) -> Result<Vec<WorktreeEntry>> {
    let stdout = process::run_capture(
        "git",
        ["worktree", "list", "--porcelain"],
        Some(repo_path),
        timeout,
    )
    .await
    .with_context(|| format!("Failed to list worktrees in {}", repo_path.display()))?;

    Ok(parse_porcelain(&stdout))
}

/// True if the checkout has uncommitted or untracked changes.
///
/// Any failure (not a repo, git missing, timeout) reads as clean.
pub async fn is_dirty(path: &Path, timeout: Duration) -> bool {
    let path_arg = path.to_string_lossy();
    match process::run_capture(
        "git",
        ["-C", path_arg.as_ref(), "status", "--porcelain"],
        None,
        timeout,
    )
    .await
    {
        Ok(stdout) => !stdout.trim().is_empty(),
        Err(_) => false,
    }
}

/// Get the current branch name
pub async fn current_branch(repo_path: &Path, timeout: Duration) -> Result<String> {
    let stdout = process::run_capture(
        "git",
        ["rev-parse", "--abbrev-ref", "HEAD"],
        Some(repo_path),
        timeout,
    )
    .await
    .context("Failed to get current branch")?;
    Ok(stdout.trim().to_string())
}

/// The checkout a path belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutInfo {
    /// Absolute path of the worktree root
    pub path: PathBuf,
    /// Branch name, or a tag/commit description when HEAD is detached
    pub branch: String,
    /// True for a linked worktree, false for the primary checkout
    pub is_linked: bool,
    /// Primary checkout path, known only for linked worktrees
    pub main_path: Option<PathBuf>,
}

/// Resolve the git checkout containing `path`.
pub async fn detect_at(path: &Path, timeout: Duration) -> Result<CheckoutInfo> {
    let abs = std::path::absolute(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;

    let toplevel = match process::run_capture(
        "git",
        ["rev-parse", "--show-toplevel"],
        Some(&abs),
        timeout,
    )
    .await
    {
        Ok(stdout) => PathBuf::from(stdout.trim()),
        Err(CommandError::Failed { stderr, .. }) => {
            bail!("{} is not a git repository: {}", abs.display(), stderr)
        }
        Err(e) => return Err(e).context("Failed to execute git rev-parse"),
    };

    let mut branch = current_branch(&abs, timeout).await?;
    if branch == "HEAD" {
        if let Some(described) =
            process::capture_stdout("git", ["describe", "--tags", "--always"], Some(&abs), timeout)
                .await
        {
            branch = described.trim().to_string();
        }
    }

    let (is_linked, main_path) = linked_worktree_main(&toplevel);

    Ok(CheckoutInfo {
        path: toplevel,
        branch,
        is_linked,
        main_path,
    })
}

/// A linked worktree has a `.git` file reading
/// `gitdir: <main>/.git/worktrees/<name>`.
fn linked_worktree_main(worktree: &Path) -> (bool, Option<PathBuf>) {
    let git_path = worktree.join(".git");
    if git_path.is_dir() {
        return (false, None);
    }
    let Ok(contents) = std::fs::read_to_string(&git_path) else {
        return (false, None);
    };
    let Some(gitdir) = contents.trim().strip_prefix("gitdir: ") else {
        return (false, None);
    };
    let main = gitdir
        .split_once("/.git/worktrees/")
        .map(|(main, _)| PathBuf::from(main));
    (true, main)
}
