mod agent;
mod proxy;
mod server;
pub(crate) mod timestamp;
mod workspace;

pub use agent::{AgentInfo, AgentType};
pub use proxy::ProxyInfo;
pub use server::{HealthStatus, ServerState, ServerStatus};
pub use workspace::Workspace;
