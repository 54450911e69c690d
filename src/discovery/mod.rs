//! Worktree discovery and activity detection.

pub mod activity;
pub mod procs;
pub mod sanitize;
pub mod scan;
pub mod tasks;

pub use activity::{ActivityDetector, ActivityReport};
pub use sanitize::{is_valid_name, sanitize_name};
pub use scan::{discover, find_all, find_repo_roots, Worktree, DETACHED_NAME};
pub use tasks::TaskRecord;
