pub mod worktree;

pub use worktree::{is_git_repo, CheckoutInfo, WorktreeEntry};
