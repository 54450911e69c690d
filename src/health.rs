//! Periodic HTTP health checks for running dev servers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::models::{HealthStatus, ServerStatus, Workspace};
use crate::registry::Registry;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub name: String,
    pub health: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

/// Shared client for health probes. Pooled connections are reused between
/// rounds.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .pool_max_idle_per_host(2)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(concat!("grove/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build health check client")
}

/// Classify a server by a single GET.
///
/// Any response below 500 means the server is up and answering, even
/// with a client error. A refused or timed-out connection is Unhealthy; a
/// URL that cannot be requested at all is Unknown.
pub async fn check_url(client: &reqwest::Client, url: &str) -> HealthStatus {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return HealthStatus::Unknown;
    };

    match client.get(parsed).send().await {
        Ok(response) => classify(response.status()),
        Err(e) if e.is_builder() => HealthStatus::Unknown,
        Err(e) => {
            debug!(url, error = %e, "health probe failed");
            HealthStatus::Unhealthy
        }
    }
}

fn classify(status: reqwest::StatusCode) -> HealthStatus {
    match status.as_u16() {
        200..=499 => HealthStatus::Healthy,
        500..=599 => HealthStatus::Unhealthy,
        _ => HealthStatus::Unknown,
    }
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    client: reqwest::Client,
    interval: Duration,
    reports: Option<mpsc::UnboundedSender<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, interval: Duration, timeout: Duration) -> Result<Self> {
        Ok(Self {
            registry,
            client: build_client(timeout)?,
            interval,
            reports: None,
        })
    }

    /// Receive every applied report, e.g. to redraw a dashboard row.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<HealthReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        rx
    }

    /// Probe one workspace's server without recording the result.
    pub async fn check_workspace(&self, workspace: &Workspace) -> HealthStatus {
        match workspace.url() {
            Some(url) => check_url(&self.client, url).await,
            None => HealthStatus::Unknown,
        }
    }

    /// Run one round: probe every Running server concurrently and write
    /// each result back as soon as it arrives.
    pub async fn check_once(&self) -> Vec<HealthReport> {
        let mut probes = JoinSet::new();
        for ws in self.registry.list_running() {
            let Some(server) = ws.server.as_ref() else {
                continue;
            };
            if server.status != ServerStatus::Running {
                continue;
            }
            let client = self.client.clone();
            let url = server.url.clone();
            let name = ws.name.clone();
            probes.spawn(async move {
                let health = check_url(&client, &url).await;
                (name, health)
            });
        }

        let mut reports = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            let (name, health) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "health probe task failed");
                    continue;
                }
            };

            match self.registry.update_health(&name, health) {
                Ok(true) => {}
                // Removed or stopped while the probe was in flight
                Ok(false) => {
                    debug!(name = %name, "skipping health result");
                    continue;
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to record health");
                    continue;
                }
            }

            let report = HealthReport {
                name,
                health,
                checked_at: Utc::now(),
            };
            if let Some(tx) = &self.reports {
                // A dropped receiver just means nobody is watching
                let _ = tx.send(report.clone());
            }
            reports.push(report);
        }
        reports
    }

    /// Run a round every interval until the returned handle is aborted.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reports = self.check_once().await;
                debug!(checked = reports.len(), "health round complete");
            }
        })
    }
}
