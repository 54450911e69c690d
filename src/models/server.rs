use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle status of a dev server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ServerStatus {
    /// Running and Starting both count as holding the port.
    pub fn is_active(&self) -> bool {
        matches!(self, ServerStatus::Running | ServerStatus::Starting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "starting" => Ok(ServerStatus::Starting),
            "running" => Ok(ServerStatus::Running),
            "stopping" => Ok(ServerStatus::Stopping),
            "stopped" => Ok(ServerStatus::Stopped),
            "crashed" => Ok(ServerStatus::Crashed),
            other => anyhow::bail!("unknown server status: {:?}", other),
        }
    }
}

/// Result of the most recent HTTP health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "✓",
            HealthStatus::Unhealthy => "✗",
            HealthStatus::Unknown => "?",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" | "" => Ok(HealthStatus::Unknown),
            other => anyhow::bail!("unknown health status: {:?}", other),
        }
    }
}

/// Runtime state of the dev server attached to a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub port: u16,
    /// Process id of the server, 0 when the process is not tracked
    #[serde(default)]
    pub pid: u32,
    pub status: ServerStatus,
    /// Only meaningful while `status` is Running
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "super::timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServerState {
    /// A server that has been launched but not yet confirmed up.
    pub fn starting(port: u16, url: String, command: Vec<String>) -> Self {
        Self {
            port,
            pid: 0,
            status: ServerStatus::Starting,
            health: HealthStatus::Unknown,
            url,
            command,
            log_file: None,
            started_at: Some(Utc::now()),
            stopped_at: None,
            last_health_check: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.status = ServerStatus::Running;
        self.pid = pid;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.stopped_at = None;
    }

    pub fn mark_stopping(&mut self) {
        self.status = ServerStatus::Stopping;
    }

    pub fn mark_stopped(&mut self) {
        self.status = ServerStatus::Stopped;
        self.pid = 0;
        self.health = HealthStatus::Unknown;
        self.stopped_at = Some(Utc::now());
    }

    pub fn mark_crashed(&mut self) {
        self.status = ServerStatus::Crashed;
        self.pid = 0;
        self.health = HealthStatus::Unknown;
        self.stopped_at = Some(Utc::now());
    }

    /// Record a probe result. Ignored unless the server is Running.
    pub fn record_health(&mut self, health: HealthStatus, at: DateTime<Utc>) -> bool {
        if self.status != ServerStatus::Running {
            return false;
        }
        self.health = health;
        self.last_health_check = Some(at);
        true
    }

    /// Time the server has been up, or how long it ran before stopping.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        if self.is_active() {
            return Some(Utc::now() - started);
        }
        self.stopped_at.map(|stopped| stopped - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_statuses() {
        assert!(ServerStatus::Running.is_active());
        assert!(ServerStatus::Starting.is_active());
        assert!(!ServerStatus::Stopping.is_active());
        assert!(!ServerStatus::Stopped.is_active());
        assert!(!ServerStatus::Crashed.is_active());
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            ServerStatus::Starting,
            ServerStatus::Running,
            ServerStatus::Stopping,
            ServerStatus::Stopped,
            ServerStatus::Crashed,
        ] {
            assert_eq!(status.as_str().parse::<ServerStatus>().unwrap(), status);
        }
        assert!("sleeping".parse::<ServerStatus>().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut server = ServerState::starting(3001, "http://localhost:3001".into(), vec![]);
        assert_eq!(server.status, ServerStatus::Starting);

        server.mark_running(1234);
        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.pid, 1234);

        server.mark_stopping();
        assert!(!server.is_active());

        server.mark_stopped();
        assert_eq!(server.pid, 0);
        assert!(server.stopped_at.is_some());
        assert!(server.uptime().is_some());
    }

    #[test]
    fn test_health_only_recorded_while_running() {
        let mut server = ServerState::starting(3001, String::new(), vec![]);
        assert!(!server.record_health(HealthStatus::Healthy, Utc::now()));
        assert_eq!(server.health, HealthStatus::Unknown);

        server.mark_running(1);
        assert!(server.record_health(HealthStatus::Healthy, Utc::now()));
        assert_eq!(server.health, HealthStatus::Healthy);
        assert!(server.last_health_check.is_some());
    }

    #[test]
    fn test_missing_health_defaults_to_unknown() {
        let json = r#"{"port":3000,"status":"running","url":"http://localhost:3000"}"#;
        let server: ServerState = serde_json::from_str(json).unwrap();
        assert_eq!(server.health, HealthStatus::Unknown);
        assert_eq!(server.pid, 0);
    }
}
