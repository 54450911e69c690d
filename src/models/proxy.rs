use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of the reverse proxy. The proxy is managed elsewhere; the
/// registry only stores what it last reported so front ends can show it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyInfo {
    #[serde(default)]
    pub pid: u32,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub https_port: u16,
}

impl ProxyInfo {
    pub fn is_running(&self) -> bool {
        self.pid > 0
    }
}
