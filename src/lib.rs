//! Workspace registry and lifecycle engine for git worktree dev servers.

pub mod config;
pub mod discovery;
pub mod git;
pub mod health;
pub mod models;
pub mod persistence;
pub mod port;
pub mod process;
pub mod registry;

pub use config::Config;
pub use models::{AgentInfo, AgentType, HealthStatus, ProxyInfo, ServerState, ServerStatus, Workspace};
pub use registry::{CleanupReport, Registry};
