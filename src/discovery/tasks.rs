//! Reader for the per-project task store (`.tasuku/tasks/*.json`).
//!
//! The store belongs to another tool. Records are read leniently, and
//! fields this crate doesn't know about survive a status rewrite.

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TASK_DIR_NAME: &str = ".tasuku";
pub const STATUS_IN_PROGRESS: &str = "in_progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    pub fn is_in_progress(&self) -> bool {
        self.status == STATUS_IN_PROGRESS
    }
}

/// Walk up from `start` to the nearest `.tasuku` directory.
pub fn find_task_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(TASK_DIR_NAME))
        .find(|candidate| candidate.is_dir())
}

/// Task files in name order. Unreadable or malformed files are skipped.
fn task_files(task_dir: &Path) -> Result<Vec<PathBuf>> {
    let tasks_dir = task_dir.join("tasks");
    let entries = std::fs::read_dir(&tasks_dir)
        .with_context(|| format!("Failed to read {}", tasks_dir.display()))?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn read_task(path: &Path) -> Option<TaskRecord> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

pub fn list_tasks(task_dir: &Path) -> Result<Vec<TaskRecord>> {
    Ok(task_files(task_dir)?
        .iter()
        .filter_map(|path| read_task(path))
        .collect())
}

/// Find a task by id, returning it with the file it lives in.
pub fn find_task(task_dir: &Path, task_id: &str) -> Result<(TaskRecord, PathBuf)> {
    task_files(task_dir)?
        .into_iter()
        .find_map(|path| {
            read_task(&path)
                .filter(|task| task.id == task_id)
                .map(|task| (task, path))
        })
        .ok_or_else(|| anyhow!("task not found: {}", task_id))
}

/// The in-progress task of the project containing `worktree`, if any.
pub fn active_task(worktree: &Path) -> Option<TaskRecord> {
    let task_dir = find_task_dir(worktree)?;
    task_files(&task_dir)
        .ok()?
        .iter()
        .filter_map(|path| read_task(path))
        .find(TaskRecord::is_in_progress)
}

/// Rewrite a task's status and bump its `updated_at`.
pub fn update_task_status(task_dir: &Path, task_id: &str, status: &str) -> Result<TaskRecord> {
    let (mut task, path) = find_task(task_dir, task_id)?;
    task.status = status.to_string();
    task.updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let contents = serde_json::to_string_pretty(&task).context("Failed to serialize task")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("Failed to write task file {}", path.display()))?;
    Ok(task)
}
